//! Container access policies and public access levels
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use serde::Deserialize;

use crate::{
    error::{BlobStorageError, Result},
    sas::SasPermissions,
};

/// Public (anonymous) read access for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublicAccessLevel {
    /// Only authorized requests are allowed
    #[default]
    None,
    /// Anonymous reads of blobs, but no listing
    Blob,
    /// Anonymous reads and listing of the container
    Container,
}

impl PublicAccessLevel {
    /// The `x-ms-blob-public-access` header value, `None` when the header is omitted
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            PublicAccessLevel::None => None,
            PublicAccessLevel::Blob => Some("blob"),
            PublicAccessLevel::Container => Some("container"),
        }
    }

    pub(crate) fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("blob") => PublicAccessLevel::Blob,
            Some("container") => PublicAccessLevel::Container,
            _ => PublicAccessLevel::None,
        }
    }
}

/// A named permission grant stored on a container, referenced by SAS tokens
/// through its id.
///
/// The permission string is sent exactly as given. The service expects the
/// characters in `racwdl` order and rejects anything else when the policies
/// are written; build it from [`SasPermissions`] to stay in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub id: String,
    pub permission: String,
    pub start: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

impl AccessPolicy {
    pub fn new(
        id: &str,
        permissions: SasPermissions,
        start: Option<DateTime<Utc>>,
        expiry: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.to_string(),
            permission: permissions.to_string(),
            start,
            expiry,
        }
    }
}

/// Everything a container ACL write replaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerAcl {
    pub public_access: PublicAccessLevel,
    pub policies: Vec<AccessPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct SignedIdentifiersXml {
    #[serde(rename = "SignedIdentifier", default)]
    identifiers: Vec<SignedIdentifierXml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SignedIdentifierXml {
    id: String,
    access_policy: Option<AccessPolicyXml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccessPolicyXml {
    start: Option<String>,
    expiry: Option<String>,
    permission: Option<String>,
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| BlobStorageError::BadRequest(format!("invalid policy time {s}: {e}"))),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Parses a `<SignedIdentifiers>` document
pub(crate) fn policies_from_xml(body: &str) -> Result<Vec<AccessPolicy>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: SignedIdentifiersXml = quick_xml::de::from_str(body)?;
    parsed
        .identifiers
        .into_iter()
        .map(|identifier| {
            let policy = identifier.access_policy.unwrap_or_default();
            Ok(AccessPolicy {
                id: identifier.id,
                permission: policy.permission.unwrap_or_default(),
                start: parse_time(policy.start)?,
                expiry: parse_time(policy.expiry)?,
            })
        })
        .collect()
}

/// Renders the complete `<SignedIdentifiers>` document for an ACL write
pub(crate) fn policies_to_xml(policies: &[AccessPolicy]) -> String {
    let mut s = String::new();
    s.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<SignedIdentifiers>");
    for policy in policies {
        s.push_str("<SignedIdentifier><Id>");
        s.push_str(&escape(policy.id.as_str()));
        s.push_str("</Id><AccessPolicy>");
        if let Some(start) = policy.start {
            s.push_str(&format!("<Start>{}</Start>", format_time(start)));
        }
        if let Some(expiry) = policy.expiry {
            s.push_str(&format!("<Expiry>{}</Expiry>", format_time(expiry)));
        }
        s.push_str(&format!(
            "<Permission>{}</Permission>",
            escape(policy.permission.as_str())
        ));
        s.push_str("</AccessPolicy></SignedIdentifier>");
    }
    s.push_str("</SignedIdentifiers>");
    s
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_service_document() {
        const S: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>
<SignedIdentifiers>
  <SignedIdentifier>
    <Id>MTIzNDU2Nzg5MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTI=</Id>
    <AccessPolicy>
      <Start>2009-09-28T08:49:37.0000000Z</Start>
      <Expiry>2009-09-29T08:49:37.0000000Z</Expiry>
      <Permission>rwd</Permission>
    </AccessPolicy>
  </SignedIdentifier>
  <SignedIdentifier>
    <Id>list-only</Id>
    <AccessPolicy>
      <Permission>l</Permission>
    </AccessPolicy>
  </SignedIdentifier>
</SignedIdentifiers>";

        let policies = policies_from_xml(S).unwrap();

        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].id, "MTIzNDU2Nzg5MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTI=");
        assert_eq!(policies[0].permission, "rwd");
        assert_eq!(
            policies[0].start,
            Some(Utc.with_ymd_and_hms(2009, 9, 28, 8, 49, 37).unwrap())
        );
        assert_eq!(policies[1].permission, "l");
        assert_eq!(policies[1].expiry, None);
    }

    #[test]
    fn parses_empty_document() {
        assert!(policies_from_xml(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><SignedIdentifiers />"
        )
        .unwrap()
        .is_empty());
        assert!(policies_from_xml("").unwrap().is_empty());
    }

    #[test]
    fn renders_document() {
        let start = Utc.with_ymd_and_hms(2022, 3, 1, 8, 0, 0).unwrap();
        let policies = vec![
            AccessPolicy::new(
                "a&b",
                "lr".parse().unwrap(),
                Some(start),
                Some(start + chrono::Duration::days(1)),
            ),
            AccessPolicy {
                id: "raw".to_string(),
                permission: "wr".to_string(),
                start: None,
                expiry: None,
            },
        ];

        assert_eq!(
            policies_to_xml(&policies),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<SignedIdentifiers>\
             <SignedIdentifier><Id>a&amp;b</Id><AccessPolicy>\
             <Start>2022-03-01T08:00:00Z</Start><Expiry>2022-03-02T08:00:00Z</Expiry>\
             <Permission>rl</Permission></AccessPolicy></SignedIdentifier>\
             <SignedIdentifier><Id>raw</Id><AccessPolicy><Permission>wr</Permission>\
             </AccessPolicy></SignedIdentifier></SignedIdentifiers>"
        );
    }

    #[test]
    fn public_access_header() {
        assert_eq!(PublicAccessLevel::None.header_value(), None);
        assert_eq!(PublicAccessLevel::Blob.header_value(), Some("blob"));
        assert_eq!(
            PublicAccessLevel::from_header(Some("container")),
            PublicAccessLevel::Container
        );
        assert_eq!(PublicAccessLevel::from_header(None), PublicAccessLevel::None);
    }
}
