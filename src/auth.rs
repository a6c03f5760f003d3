//! Authentication utilities for working with the API
//!
//! Requests are authorized either with the account's Shared Key, by appending
//! a SAS token to the query string, or not at all (public containers).
use std::{collections::BTreeMap, fmt::Write};

use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::debug;
use reqwest::{
    header::{self, HeaderName, HeaderValue},
    Request,
};
use sha2::Sha256;

use crate::error::{BlobStorageError, Result};

pub(crate) const X_MS_DATE: &str = "x-ms-date";

/// The credential attached to every request made by the client
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Account name and base64 encoded account key
    SharedKey {
        account_name: String,
        account_key: String,
    },
    /// A pre-signed SAS query string, without the leading `?`
    SasToken(String),
    /// No authorization, only useful against public containers
    Anonymous,
}

// Custom implementation of Debug to avoid printing secrets
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::SharedKey { account_name, .. } => f
                .debug_struct("SharedKey")
                .field("account_name", account_name)
                .field("account_key", &"**********")
                .finish(),
            Credential::SasToken(_) => f.debug_tuple("SasToken").field(&"**********").finish(),
            Credential::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Base64 encoded HMAC with SHA256 hash, keyed by a base64 encoded key.
pub(crate) fn base64_hmac_sha256(base64_key: &str, content: &[u8]) -> Result<String> {
    let key = BASE64_STANDARD.decode(base64_key).map_err(|e| {
        BlobStorageError::malformed(format!("AccountKey is not valid base64: {e}"))
    })?;
    // HMAC accepts keys of any length
    let mut h = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| BlobStorageError::malformed(format!("unusable AccountKey: {e}")))?;
    h.update(content);

    Ok(BASE64_STANDARD.encode(h.finalize().into_bytes()))
}

/// Format a time the way the `x-ms-date` header expects it
pub(crate) fn format_http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Stamps the request with `x-ms-date` and authorizes it with the credential.
pub(crate) fn sign_request(
    request: &mut Request,
    credential: &Credential,
    now: DateTime<Utc>,
) -> Result<()> {
    request.headers_mut().insert(
        HeaderName::from_static(X_MS_DATE),
        header_value(&format_http_date(now))?,
    );

    match credential {
        Credential::Anonymous => Ok(()),
        Credential::SasToken(token) => {
            let url = request.url_mut();
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                _ => token.clone(),
            };
            url.set_query(Some(&query));
            Ok(())
        }
        Credential::SharedKey {
            account_name,
            account_key,
        } => {
            let string_to_sign = string_to_sign(request, account_name);
            let signature = base64_hmac_sha256(account_key, string_to_sign.as_bytes())?;

            let mut value = header_value(&format!("SharedKey {account_name}:{signature}"))?;
            value.set_sensitive(true);
            request.headers_mut().insert(header::AUTHORIZATION, value);
            Ok(())
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| BlobStorageError::InvalidInput(format!("invalid header value: {e}")))
}

fn header_or_empty<'a>(request: &'a Request, name: &HeaderName) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Construct string to sign
///
/// ## Format
///
/// ```text
/// VERB + "\n" +
/// Content-Encoding + "\n" +
/// Content-Language + "\n" +
/// Content-Length + "\n" +
/// Content-MD5 + "\n" +
/// Content-Type + "\n" +
/// Date + "\n" +
/// If-Modified-Since + "\n" +
/// If-Match + "\n" +
/// If-None-Match + "\n" +
/// If-Unmodified-Since + "\n" +
/// Range + "\n" +
/// CanonicalizedHeaders +
/// CanonicalizedResource;
/// ```
///
/// ## Reference
///
/// - [Authorize with Shared Key](https://docs.microsoft.com/en-us/rest/api/storageservices/authorize-with-shared-key)
pub(crate) fn string_to_sign(request: &Request, account_name: &str) -> String {
    let content_length = match header_or_empty(request, &header::CONTENT_LENGTH) {
        "0" => "",
        other => other,
    };

    let mut s = String::with_capacity(256);
    s.push_str(request.method().as_str());
    s.push('\n');
    for value in [
        header_or_empty(request, &header::CONTENT_ENCODING),
        header_or_empty(request, &header::CONTENT_LANGUAGE),
        content_length,
        header_or_empty(request, &HeaderName::from_static("content-md5")),
        header_or_empty(request, &header::CONTENT_TYPE),
        header_or_empty(request, &header::DATE),
        header_or_empty(request, &header::IF_MODIFIED_SINCE),
        header_or_empty(request, &header::IF_MATCH),
        header_or_empty(request, &header::IF_NONE_MATCH),
        header_or_empty(request, &header::IF_UNMODIFIED_SINCE),
        header_or_empty(request, &header::RANGE),
    ] {
        s.push_str(value);
        s.push('\n');
    }
    s.push_str(&canonicalize_headers(request));
    s.push_str(&canonicalize_resource(request, account_name));

    debug!("string to sign: {:?}", &s);

    s
}

/// All `x-ms-` headers, sorted by name, one `name:value` per line.
fn canonicalize_headers(request: &Request) -> String {
    let mut headers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in request.headers() {
        if name.as_str().starts_with("x-ms-") {
            headers
                .entry(name.as_str())
                .or_default()
                .push(value.to_str().unwrap_or("").trim());
        }
    }

    let mut s = String::new();
    for (name, values) in headers {
        let _ = writeln!(s, "{}:{}", name, values.join(","));
    }
    s
}

/// `/account/path` followed by the decoded query parameters, sorted by
/// lowercased name, one `name:value[,value]` per line.
fn canonicalize_resource(request: &Request, account_name: &str) -> String {
    let url = request.url();
    let mut s = format!("/{}{}", account_name, url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        params
            .entry(k.to_lowercase())
            .or_default()
            .push(v.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        let _ = write!(s, "\n{}:{}", name, values.join(","));
    }
    s
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use reqwest::{Client, Method};

    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 1, 8, 12, 34).unwrap()
    }

    fn test_credential() -> Credential {
        Credential::SharedKey {
            account_name: "account".to_string(),
            account_key: BASE64_STANDARD.encode("key"),
        }
    }

    #[test]
    fn can_sign_list_request() {
        let mut request = Client::new()
            .request(
                Method::GET,
                "https://account.blob.core.windows.net/photos?restype=container&comp=list",
            )
            .header("x-ms-version", "2021-08-06")
            .build()
            .unwrap();

        sign_request(&mut request, &test_credential(), test_time()).unwrap();

        assert_eq!(
            string_to_sign(&request, "account"),
            "GET\n\n\n\n\n\n\n\n\n\n\n\n\
             x-ms-date:Tue, 01 Mar 2022 08:12:34 GMT\n\
             x-ms-version:2021-08-06\n\
             /account/photos\ncomp:list\nrestype:container"
        );
        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "SharedKey account:iKDaZQqyB7i57lb3r/OSZ4Dfz2dLV86cvC+pFI3io70="
        );
    }

    #[test]
    fn can_sign_put_with_body_headers() {
        let mut request = Client::new()
            .request(
                Method::PUT,
                "https://account.blob.core.windows.net/photos/folder1/my%20cat.txt",
            )
            .header(header::CONTENT_LENGTH, "11")
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::IF_NONE_MATCH, "*")
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", "2021-08-06")
            .body("hello world")
            .build()
            .unwrap();

        sign_request(&mut request, &test_credential(), test_time()).unwrap();

        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "SharedKey account:CJ5uR64oBN4RHip9PaofPFsa544xuXTVTJVfq8oeoaM="
        );
    }

    #[test]
    fn zero_content_length_is_blank() {
        let request = Client::new()
            .request(Method::PUT, "https://account.blob.core.windows.net/photos")
            .header(header::CONTENT_LENGTH, "0")
            .build()
            .unwrap();

        assert!(string_to_sign(&request, "account").starts_with("PUT\n\n\n\n"));
    }

    #[test]
    fn sas_credential_extends_query() {
        let mut request = Client::new()
            .request(
                Method::GET,
                "https://account.blob.core.windows.net/photos?restype=container",
            )
            .build()
            .unwrap();
        let credential = Credential::SasToken("sv=2018-11-09&sig=abc".to_string());

        sign_request(&mut request, &credential, test_time()).unwrap();

        assert_eq!(
            request.url().query(),
            Some("restype=container&sv=2018-11-09&sig=abc")
        );
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn bad_key_is_malformed() {
        let err = base64_hmac_sha256("not base64!", b"content").unwrap_err();
        assert!(matches!(
            err,
            BlobStorageError::MalformedConnectionDescriptor(_)
        ));
    }
}
