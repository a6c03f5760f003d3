//! Shared access signatures for blobs and containers
//!
//! A [`SasTokenBuilder`] turns a [`SasDescriptor`] into a signed query string
//! using the account key. Nothing here reads the clock: every time that ends
//! up in a token comes from the descriptor, so identical descriptors always
//! produce byte-identical tokens.
use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use log::warn;

use crate::{
    auth::base64_hmac_sha256,
    connection::ConnectionContext,
    error::{BlobStorageError, Result},
};

/// The signed version used for service SAS tokens
/// https://learn.microsoft.com/en-us/rest/api/storageservices/create-service-sas
const SERVICE_SAS_VERSION: &str = "2018-11-09";

/// Start times are back-dated by this much to tolerate clock skew
const CLOCK_SKEW_MINUTES: i64 = 5;

/// The permissions a SAS token or access policy grants.
///
/// Rendered in the order the service requires: read, add, create, write,
/// delete, list (`racwdl`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SasPermissions {
    pub read: bool,
    pub add: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
    pub list: bool,
}

impl SasPermissions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            read: true,
            add: true,
            create: true,
            write: true,
            delete: true,
            list: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for SasPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (granted, c) in [
            (self.read, 'r'),
            (self.add, 'a'),
            (self.create, 'c'),
            (self.write, 'w'),
            (self.delete, 'd'),
            (self.list, 'l'),
        ] {
            if granted {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Parses a permission string in any order. Only the rendered form is
/// guaranteed to be in canonical order.
impl FromStr for SasPermissions {
    type Err = BlobStorageError;

    fn from_str(s: &str) -> Result<Self> {
        let mut permissions = Self::default();
        for c in s.chars() {
            match c {
                'r' => permissions.read = true,
                'a' => permissions.add = true,
                'c' => permissions.create = true,
                'w' => permissions.write = true,
                'd' => permissions.delete = true,
                'l' => permissions.list = true,
                other => {
                    return Err(BlobStorageError::InvalidInput(format!(
                        "unknown permission '{other}' in '{s}'"
                    )))
                }
            }
        }
        Ok(permissions)
    }
}

/// The kind of resource a token is scoped to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SasResourceKind {
    Blob,
    Container,
}

impl SasResourceKind {
    /// The `sr` query parameter value
    fn signed_resource(&self) -> &'static str {
        match self {
            SasResourceKind::Blob => "b",
            SasResourceKind::Container => "c",
        }
    }
}

impl FromStr for SasResourceKind {
    type Err = BlobStorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(SasResourceKind::Blob),
            "container" => Ok(SasResourceKind::Container),
            other => Err(BlobStorageError::InvalidInput(format!(
                "resource must be \"blob\" or \"container\", got \"{other}\""
            ))),
        }
    }
}

/// The resource a token is scoped to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SasResource {
    Blob { container: String, blob: String },
    Container { container: String },
}

impl SasResource {
    pub fn kind(&self) -> SasResourceKind {
        match self {
            SasResource::Blob { .. } => SasResourceKind::Blob,
            SasResource::Container { .. } => SasResourceKind::Container,
        }
    }

    fn canonicalized(&self, account_name: &str) -> String {
        match self {
            SasResource::Blob { container, blob } => {
                format!("/blob/{account_name}/{container}/{blob}")
            }
            SasResource::Container { container } => format!("/blob/{account_name}/{container}"),
        }
    }
}

/// An explicit validity window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SasWindow {
    pub start: Option<DateTime<Utc>>,
    pub expiry: DateTime<Utc>,
}

impl SasWindow {
    pub fn new(start: Option<DateTime<Utc>>, expiry: DateTime<Utc>) -> Self {
        Self { start, expiry }
    }

    /// A window valid from a few minutes before `now` until `now + validity`
    pub fn starting_at(now: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            start: Some(now - Duration::minutes(CLOCK_SKEW_MINUTES)),
            expiry: now + validity,
        }
    }
}

/// Specifies the protocol permitted for a request made with the SAS ([Azure documentation](https://docs.microsoft.com/rest/api/storageservices/create-service-sas#specifying-the-http-protocol)).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SasProtocol {
    Https,
    HttpHttps,
}

impl fmt::Display for SasProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SasProtocol::Https => write!(f, "https"),
            SasProtocol::HttpHttps => write!(f, "http,https"),
        }
    }
}

/// A request to mint a SAS token.
///
/// Validity should come from exactly one of `window` or `policy_id`. The
/// service rejects tokens that carry both, but the builder only refuses them
/// when it is in strict mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SasDescriptor {
    pub resource: SasResource,
    /// Omit when the referenced policy supplies the permissions
    pub permissions: Option<SasPermissions>,
    pub window: Option<SasWindow>,
    pub policy_id: Option<String>,
    pub protocol: Option<SasProtocol>,
}

impl SasDescriptor {
    pub fn blob(container: &str, blob: &str) -> Self {
        Self::for_resource(SasResource::Blob {
            container: container.to_string(),
            blob: blob.to_string(),
        })
    }

    pub fn container(container: &str) -> Self {
        Self::for_resource(SasResource::Container {
            container: container.to_string(),
        })
    }

    fn for_resource(resource: SasResource) -> Self {
        Self {
            resource,
            permissions: None,
            window: None,
            policy_id: None,
            protocol: None,
        }
    }

    pub fn with_permissions(mut self, permissions: SasPermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_window(mut self, window: SasWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_policy(mut self, policy_id: &str) -> Self {
        self.policy_id = Some(policy_id.to_string());
        self
    }

    pub fn with_protocol(mut self, protocol: SasProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// True when both an explicit window and a policy id are present
    pub fn has_conflict(&self) -> bool {
        self.window.is_some() && self.policy_id.is_some()
    }
}

/// A signed query string, without the leading `?`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SasToken(String);

impl SasToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends the token to a resource URL
    pub fn append_to(&self, url: &str) -> String {
        if url.contains('?') {
            format!("{url}&{}", self.0)
        } else {
            format!("{url}?{}", self.0)
        }
    }

    /// The token plus the two parameters a plain GET needs to list a
    /// container. They are not part of the signed string, so appending them
    /// leaves the signature valid.
    pub fn with_listing_params(&self) -> String {
        format!("{}&restype=container&comp=list", self.0)
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SasToken> for String {
    fn from(token: SasToken) -> Self {
        token.0
    }
}

/// Builds service SAS tokens for one storage account
pub struct SasTokenBuilder {
    account_name: String,
    account_key: String,
    strict: bool,
}

// Custom implementation of Debug to avoid printing the key
impl fmt::Debug for SasTokenBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasTokenBuilder")
            .field("account_name", &self.account_name)
            .field("account_key", &"**********")
            .field("strict", &self.strict)
            .finish()
    }
}

impl SasTokenBuilder {
    pub fn new(account_name: &str, account_key: &str) -> Self {
        Self {
            account_name: account_name.to_string(),
            account_key: account_key.to_string(),
            strict: false,
        }
    }

    /// Fails if the connection string carries no account name or key
    pub fn from_context(context: &ConnectionContext) -> Result<Self> {
        let (account_name, account_key) = context.shared_key()?;
        Ok(Self::new(account_name, account_key))
    }

    /// Reject descriptors that combine a window with a policy id instead of
    /// signing them and letting the service refuse the token later.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    // https://learn.microsoft.com/en-us/rest/api/storageservices/create-service-sas#version-2018-11-09-and-later
    fn string_to_sign(&self, descriptor: &SasDescriptor) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
            descriptor
                .permissions
                .map(|p| p.to_string())
                .unwrap_or_default(),
            descriptor
                .window
                .and_then(|w| w.start)
                .map(format_sas_time)
                .unwrap_or_default(),
            descriptor
                .window
                .map(|w| format_sas_time(w.expiry))
                .unwrap_or_default(),
            descriptor.resource.canonicalized(&self.account_name),
            descriptor.policy_id.as_deref().unwrap_or(""),
            "", // signed ip
            descriptor
                .protocol
                .map(|p| p.to_string())
                .unwrap_or_default(),
            SERVICE_SAS_VERSION,
            descriptor.resource.kind().signed_resource(),
            "", // snapshot time
            "", // rscc
            "", // rscd
            "", // rsce
            "", // rscl
            "", // rsct
        )
    }

    /// [Example](https://docs.microsoft.com/rest/api/storageservices/create-service-sas#service-sas-example) from Azure documentation.
    pub fn token(&self, descriptor: &SasDescriptor) -> Result<SasToken> {
        if descriptor.window.is_none() && descriptor.policy_id.is_none() {
            return Err(BlobStorageError::InvalidInput(
                "a SAS token needs either an explicit window or a policy id".to_string(),
            ));
        }
        if descriptor.has_conflict() {
            let policy_id = descriptor.policy_id.clone().unwrap_or_default();
            if self.strict {
                return Err(BlobStorageError::SasConflict(policy_id));
            }
            warn!(
                "SAS token combines an explicit window with policy {policy_id}; the service will reject it"
            );
        }

        let mut elements: Vec<(&str, String)> = vec![
            ("sv", SERVICE_SAS_VERSION.to_string()),
            ("sr", descriptor.resource.kind().signed_resource().to_string()),
        ];
        if let Some(permissions) = descriptor.permissions {
            elements.push(("sp", permissions.to_string()));
        }
        if let Some(window) = descriptor.window {
            if let Some(start) = window.start {
                elements.push(("st", format_sas_time(start)));
            }
            elements.push(("se", format_sas_time(window.expiry)));
        }
        if let Some(policy_id) = &descriptor.policy_id {
            elements.push(("si", policy_id.clone()));
        }
        if let Some(protocol) = descriptor.protocol {
            elements.push(("spr", protocol.to_string()));
        }

        let signature =
            base64_hmac_sha256(&self.account_key, self.string_to_sign(descriptor).as_bytes())?;
        elements.push(("sig", signature));

        let token = elements
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, urlencoded(&v)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(SasToken(token))
    }
}

fn format_sas_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn urlencoded(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
