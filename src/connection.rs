//! Parsing of storage account connection strings
use std::{collections::HashMap, str::FromStr};

use log::debug;

use crate::{
    auth::Credential,
    error::{BlobStorageError, Result},
};

// Storage emulator defaults.
const EMULATOR_ACCOUNT_NAME: &str = "devstoreaccount1";
const EMULATOR_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const EMULATOR_BLOB_URI: &str = "http://127.0.0.1:10000";

/// The storage services a connection string may point at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    Blob,
    Queue,
    Table,
    File,
}

impl Service {
    fn endpoint_key(&self) -> &'static str {
        match self {
            Service::Blob => "BlobEndpoint",
            Service::Queue => "QueueEndpoint",
            Service::Table => "TableEndpoint",
            Service::File => "FileEndpoint",
        }
    }

    fn host_label(&self) -> &'static str {
        match self {
            Service::Blob => "blob",
            Service::Queue => "queue",
            Service::Table => "table",
            Service::File => "file",
        }
    }
}

/// Credentials and endpoints for one storage account.
///
/// Built once from a connection string and never mutated afterwards. The
/// account key is only required by operations that sign something, so a
/// string without one still parses; asking for the key later fails with
/// [`BlobStorageError::MalformedConnectionDescriptor`].
///
/// When a key appears more than once the last occurrence wins.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ConnectionContext {
    account_name: Option<String>,
    account_key: Option<String>,
    sas_token: Option<String>,
    protocol: String,
    endpoint_suffix: Option<String>,
    endpoints: HashMap<String, String>,
}

// Custom implementation of Debug to avoid printing the key
impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("account_name", &self.account_name)
            .field("account_key", &self.account_key.as_ref().map(|_| "**********"))
            .field("sas_token", &self.sas_token.as_ref().map(|_| "**********"))
            .field("protocol", &self.protocol)
            .field("endpoint_suffix", &self.endpoint_suffix)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl ConnectionContext {
    /// Parses a `Key=Value;Key=Value` connection string.
    ///
    /// Values may themselves contain `=` (account keys usually end in one),
    /// so each segment is split on its first `=` only.
    pub fn parse(raw: &str) -> Result<Self> {
        let key_values = parse_into_key_values(raw)?;

        if key_values.get("UseDevelopmentStorage").map(String::as_str) == Some("true") {
            return Ok(Self::development(&key_values));
        }

        let protocol = key_values
            .get("DefaultEndpointsProtocol")
            .cloned()
            .unwrap_or_else(|| "https".to_string());
        if protocol != "http" && protocol != "https" {
            return Err(BlobStorageError::malformed(format!(
                "invalid DefaultEndpointsProtocol: {protocol}"
            )));
        }

        let endpoints = [Service::Blob, Service::Queue, Service::Table, Service::File]
            .iter()
            .filter_map(|service| {
                key_values
                    .get(service.endpoint_key())
                    .map(|endpoint| (service.endpoint_key().to_string(), endpoint.clone()))
            })
            .collect();

        let context = Self {
            account_name: key_values.get("AccountName").cloned(),
            account_key: key_values.get("AccountKey").cloned(),
            sas_token: key_values
                .get("SharedAccessSignature")
                .map(|token| token.trim_start_matches('?').to_string()),
            protocol,
            endpoint_suffix: key_values.get("EndpointSuffix").cloned(),
            endpoints,
        };
        debug!("parsed connection string: {:?}", context);
        Ok(context)
    }

    fn development(key_values: &HashMap<String, String>) -> Self {
        let account_name = key_values
            .get("AccountName")
            .cloned()
            .unwrap_or_else(|| EMULATOR_ACCOUNT_NAME.to_string());
        let account_key = key_values
            .get("AccountKey")
            .cloned()
            .unwrap_or_else(|| EMULATOR_ACCOUNT_KEY.to_string());
        let proxy_uri = key_values
            .get("DevelopmentStorageProxyUri")
            .cloned()
            .unwrap_or_else(|| EMULATOR_BLOB_URI.to_string());

        let mut endpoints = HashMap::new();
        endpoints.insert(
            Service::Blob.endpoint_key().to_string(),
            format!("{}/{}", proxy_uri.trim_end_matches('/'), account_name),
        );

        Self {
            account_name: Some(account_name),
            account_key: Some(account_key),
            sas_token: None,
            protocol: "http".to_string(),
            endpoint_suffix: None,
            endpoints,
        }
    }

    pub fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }

    pub fn sas_token(&self) -> Option<&str> {
        self.sas_token.as_deref()
    }

    /// Returns the account name and key needed to sign requests or SAS tokens
    pub fn shared_key(&self) -> Result<(&str, &str)> {
        let name = self
            .account_name
            .as_deref()
            .ok_or_else(|| BlobStorageError::malformed("AccountName is required for signing"))?;
        let key = self
            .account_key
            .as_deref()
            .ok_or_else(|| BlobStorageError::malformed("AccountKey is required for signing"))?;
        Ok((name, key))
    }

    /// The credential used to authorize requests made with this context.
    ///
    /// A SAS token takes precedence over the account key.
    pub fn credential(&self) -> Credential {
        if let Some(token) = &self.sas_token {
            return Credential::SasToken(token.clone());
        }
        match (&self.account_name, &self.account_key) {
            (Some(account_name), Some(account_key)) => Credential::SharedKey {
                account_name: account_name.clone(),
                account_key: account_key.clone(),
            },
            _ => Credential::Anonymous,
        }
    }

    /// The endpoint of the given service, either given explicitly or built
    /// from the account name, protocol and endpoint suffix.
    pub fn endpoint(&self, service: Service) -> Option<String> {
        if let Some(endpoint) = self.endpoints.get(service.endpoint_key()) {
            return Some(endpoint.trim_end_matches('/').to_string());
        }
        match (&self.account_name, &self.endpoint_suffix) {
            (Some(account_name), Some(suffix)) => Some(format!(
                "{}://{}.{}.{}",
                self.protocol,
                account_name,
                service.host_label(),
                suffix
            )),
            _ => None,
        }
    }

    pub fn blob_endpoint(&self) -> Result<String> {
        self.endpoint(Service::Blob).ok_or_else(|| {
            BlobStorageError::malformed(
                "either BlobEndpoint or AccountName and EndpointSuffix are required",
            )
        })
    }
}

impl FromStr for ConnectionContext {
    type Err = BlobStorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_into_key_values(raw: &str) -> Result<HashMap<String, String>> {
    raw.trim()
        .replace('\n', "")
        .split(';')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            let (key, value) = field.split_once('=').ok_or_else(|| {
                BlobStorageError::malformed(format!("expected '=' in field: {}", field))
            })?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_true;

    use super::*;

    const KEY: &str = "dGVzdGtleQ==";

    #[test]
    fn credentials_survive_any_key_order() {
        let fields = [
            "AccountName=testaccount".to_string(),
            format!("AccountKey={KEY}"),
            "DefaultEndpointsProtocol=https".to_string(),
            "EndpointSuffix=core.windows.net".to_string(),
        ];
        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [1, 0, 2, 3],
            [3, 2, 1, 0],
            [2, 0, 3, 1],
            [1, 3, 0, 2],
            [3, 1, 2, 0],
        ];

        for order in orders {
            let conn_str = order
                .iter()
                .map(|idx| fields[*idx].as_str())
                .collect::<Vec<_>>()
                .join(";");
            let ctx = ConnectionContext::parse(&conn_str).unwrap();
            assert_eq!(ctx.shared_key().unwrap(), ("testaccount", KEY), "{conn_str}");
        }
    }

    #[test]
    fn value_keeps_equals_signs() {
        let ctx = ConnectionContext::parse("AccountName=a;AccountKey=abc==").unwrap();
        assert_eq!(ctx.shared_key().unwrap().1, "abc==");
    }

    #[test]
    fn missing_equals_is_malformed() {
        let err = ConnectionContext::parse("AccountNameexample;AccountKey=example").unwrap_err();
        assert_true!(matches!(
            err,
            BlobStorageError::MalformedConnectionDescriptor(_)
        ));
    }

    #[test]
    fn missing_key_fails_only_when_signing() {
        let ctx = ConnectionContext::parse(
            "BlobEndpoint=https://testaccount.blob.core.windows.net/;AccountName=testaccount",
        )
        .unwrap();
        assert_eq!(
            ctx.blob_endpoint().unwrap(),
            "https://testaccount.blob.core.windows.net"
        );
        assert_true!(matches!(
            ctx.shared_key(),
            Err(BlobStorageError::MalformedConnectionDescriptor(_))
        ));
        assert_eq!(ctx.credential(), Credential::Anonymous);
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let ctx = ConnectionContext::parse("AccountName=first;AccountKey=k;AccountName=second")
            .unwrap();
        assert_eq!(ctx.account_name(), Some("second"));
    }

    #[test]
    fn endpoints_from_parts() {
        let ctx = ConnectionContext::parse(
            "AccountName=testaccount;EndpointSuffix=core.windows.net;DefaultEndpointsProtocol=http",
        )
        .unwrap();
        assert_eq!(
            ctx.endpoint(Service::Blob).unwrap(),
            "http://testaccount.blob.core.windows.net"
        );
        assert_eq!(
            ctx.endpoint(Service::Queue).unwrap(),
            "http://testaccount.queue.core.windows.net"
        );
    }

    #[test]
    fn protocol_defaults_to_https_and_rejects_others() {
        let ctx =
            ConnectionContext::parse("AccountName=testaccount;EndpointSuffix=core.windows.net")
                .unwrap();
        assert_eq!(
            ctx.blob_endpoint().unwrap(),
            "https://testaccount.blob.core.windows.net"
        );

        assert_true!(ConnectionContext::parse(
            "DefaultEndpointsProtocol=ftp;AccountName=a;EndpointSuffix=core.windows.net"
        )
        .is_err());
    }

    #[test]
    fn explicit_endpoint_wins_over_parts() {
        let ctx = ConnectionContext::parse(
            "AccountName=a;EndpointSuffix=core.windows.net;FileEndpoint=https://files.example.com/",
        )
        .unwrap();
        assert_eq!(
            ctx.endpoint(Service::File).unwrap(),
            "https://files.example.com"
        );
        assert_eq!(
            ctx.endpoint(Service::Table).unwrap(),
            "https://a.table.core.windows.net"
        );
    }

    #[test]
    fn sas_token_takes_precedence() {
        let ctx = ConnectionContext::parse(
            "AccountName=a;AccountKey=k;SharedAccessSignature=?sv=2018-11-09&sig=abc",
        )
        .unwrap();
        assert_eq!(
            ctx.credential(),
            Credential::SasToken("sv=2018-11-09&sig=abc".to_string())
        );
    }

    #[test]
    fn development_storage() {
        let ctx = ConnectionContext::parse("UseDevelopmentStorage=true").unwrap();
        assert_eq!(
            ctx.shared_key().unwrap(),
            (EMULATOR_ACCOUNT_NAME, EMULATOR_ACCOUNT_KEY)
        );
        assert_eq!(
            ctx.blob_endpoint().unwrap(),
            "http://127.0.0.1:10000/devstoreaccount1"
        );

        let ctx = ConnectionContext::parse(
            "UseDevelopmentStorage=true;DevelopmentStorageProxyUri=http://127.0.0.1:12345",
        )
        .unwrap();
        assert_eq!(
            ctx.blob_endpoint().unwrap(),
            "http://127.0.0.1:12345/devstoreaccount1"
        );
    }

    #[test]
    fn line_breaks_and_stray_separators() {
        let ctx = ConnectionContext::parse(
            r#";
            AccountName=testaccount;
            AccountKey=testkey;
            EndpointSuffix=core.windows.net;"#,
        )
        .unwrap();
        assert_eq!(ctx.shared_key().unwrap(), ("testaccount", "testkey"));
    }

    #[test]
    fn debug_hides_secrets() {
        let ctx = ConnectionContext::parse(&format!("AccountName=a;AccountKey={KEY}")).unwrap();
        assert_true!(!format!("{:?}", ctx).contains(KEY));
    }
}
