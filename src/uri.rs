//! Parsing and building blob URLs
use std::net::IpAddr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;

use crate::error::{BlobStorageError, Result};

/// Characters left alone when a blob name becomes a URL path. `/` is kept so
/// that "folders" stay readable.
const BLOB_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A fully qualified blob URL broken into its parts.
///
/// Both the public form `https://{account}.blob.core.windows.net/{container}/{blob}`
/// and the emulator form `http://127.0.0.1:10000/{account}/{container}/{blob}`
/// are understood. The blob name is percent-decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobUri {
    pub account: String,
    pub container: String,
    pub blob: String,
    /// The query string when it looks like a SAS token
    pub sas_token: Option<String>,
}

impl BlobUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| BlobStorageError::InvalidUri(format!("{uri}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| BlobStorageError::InvalidUri(format!("{uri}: missing host")))?;

        let path = url.path().trim_start_matches('/');
        let (account, rest) = if is_path_style(host) {
            path.split_once('/').ok_or_else(|| {
                BlobStorageError::InvalidUri(format!("{uri}: missing container"))
            })?
        } else {
            let account = host
                .split('.')
                .next()
                .ok_or_else(|| BlobStorageError::InvalidUri(format!("{uri}: missing account")))?;
            (account, path)
        };

        let (container, blob) = rest
            .split_once('/')
            .filter(|(container, blob)| !container.is_empty() && !blob.is_empty())
            .ok_or_else(|| {
                BlobStorageError::InvalidUri(format!("{uri}: expected /container/blob"))
            })?;

        let blob = percent_decode_str(blob)
            .decode_utf8()
            .map_err(|e| BlobStorageError::InvalidUri(format!("{uri}: {e}")))?
            .into_owned();

        let sas_token = url
            .query()
            .filter(|_| url.query_pairs().any(|(k, _)| k == "sig"))
            .map(str::to_string);

        Ok(Self {
            account: account.to_string(),
            container: percent_decode_str(container)
                .decode_utf8_lossy()
                .into_owned(),
            blob,
            sas_token,
        })
    }
}

/// Emulators and proxies put the account in the path instead of the host
fn is_path_style(host: &str) -> bool {
    host == "localhost" || host.parse::<IpAddr>().is_ok() || host.starts_with('[')
}

/// Joins an endpoint, a container and an optional blob name into a URL,
/// percent-encoding the blob name.
pub(crate) fn resource_url(endpoint: &str, container: &str, blob: Option<&str>) -> Result<Url> {
    let mut url = format!("{}/{}", endpoint.trim_end_matches('/'), container);
    if let Some(blob) = blob {
        url.push('/');
        url.extend(utf8_percent_encode(blob, BLOB_PATH_ENCODE_SET));
    }
    Url::parse(&url).map_err(|e| BlobStorageError::InvalidUri(format!("{url}: {e}")))
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_true;

    use super::*;

    #[test]
    fn parses_public_url() {
        let uri = BlobUri::parse(
            "https://myaccount.blob.core.windows.net/photos/folder1/my%20cat.jpg",
        )
        .unwrap();

        assert_eq!(uri.account, "myaccount");
        assert_eq!(uri.container, "photos");
        assert_eq!(uri.blob, "folder1/my cat.jpg");
        assert_true!(uri.sas_token.is_none());
    }

    #[test]
    fn parses_emulator_url() {
        let uri =
            BlobUri::parse("http://127.0.0.1:10000/devstoreaccount1/photos/cat.jpg").unwrap();

        assert_eq!(uri.account, "devstoreaccount1");
        assert_eq!(uri.container, "photos");
        assert_eq!(uri.blob, "cat.jpg");
    }

    #[test]
    fn detects_embedded_sas() {
        let uri = BlobUri::parse(
            "https://myaccount.blob.core.windows.net/photos/cat.jpg?sv=2018-11-09&sr=b&sig=abc",
        )
        .unwrap();
        assert_eq!(uri.sas_token.as_deref(), Some("sv=2018-11-09&sr=b&sig=abc"));

        let uri =
            BlobUri::parse("https://myaccount.blob.core.windows.net/photos/cat.jpg?foo=bar")
                .unwrap();
        assert_true!(uri.sas_token.is_none());
    }

    #[test]
    fn rejects_urls_without_blob() {
        for uri in [
            "https://myaccount.blob.core.windows.net/photos",
            "https://myaccount.blob.core.windows.net/photos/",
            "http://127.0.0.1:10000/devstoreaccount1/photos",
            "not a url",
        ] {
            assert_true!(
                matches!(BlobUri::parse(uri), Err(BlobStorageError::InvalidUri(_))),
                "{uri}"
            );
        }
    }

    #[test]
    fn builds_encoded_urls() {
        let url = resource_url(
            "https://myaccount.blob.core.windows.net/",
            "photos",
            Some("folder1/my cat+1.jpg"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://myaccount.blob.core.windows.net/photos/folder1/my%20cat%2B1.jpg"
        );

        let parsed = BlobUri::parse(url.as_str()).unwrap();
        assert_eq!(parsed.blob, "folder1/my cat+1.jpg");
    }
}
