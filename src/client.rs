//! A Rust definition of the API and a client to access it
use std::{env, ops::Range, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use log::{debug, warn};
use once_cell::sync::Lazy;
use reqwest::{
    header::{self, HeaderMap},
    Body, Client, Method, RequestBuilder, Response, StatusCode, Url,
};
use serde::Deserialize;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::{
    auth::{sign_request, Credential},
    connection::ConnectionContext,
    copy::{
        CopyHandle, CopyOptions, CopyOrchestrator, CopyProgress, CopyResult, CopyTransport,
    },
    error::{BlobStorageError, Result},
    policy::{policies_from_xml, policies_to_xml, AccessPolicy, ContainerAcl, PublicAccessLevel},
    sas::{SasDescriptor, SasToken, SasTokenBuilder},
    uri::{resource_url, BlobUri},
};

const DEFAULT_API_VERSION: &str = "2021-08-06";
/// Connection string used by [`BlobStorageClient::from_env`]
pub const CONNECTION_STRING_ENV: &str = "AZURE_STORAGE_CONNECTION_STRING";
const API_VERSION_ENV: &str = "AZURE_STORAGE_API_VERSION_OVERRIDE";

const X_MS_VERSION: &str = "x-ms-version";
const X_MS_ERROR_CODE: &str = "x-ms-error-code";
const X_MS_BLOB_PUBLIC_ACCESS: &str = "x-ms-blob-public-access";
const X_MS_COPY_ID: &str = "x-ms-copy-id";
const X_MS_COPY_STATUS: &str = "x-ms-copy-status";

static GLOBAL_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// A client for one storage account
///
/// The client is built from a connection string (see [`ConnectionContext`])
/// and authorizes every request with the account key, or with the SAS token
/// when the connection string carries one.
///
/// ```ignore
/// let client = BlobStorageClient::from_env()?;
/// client.create_container_if_absent("photos").await?;
/// client
///     .upload_blob("photos", "cat.jpg", Path::new("cat.jpg"), true)
///     .await?;
/// ```
#[derive(Debug)]
pub struct BlobStorageClient {
    context: ConnectionContext,
    credential: Credential,
    /// The blob service endpoint, without a trailing `/`
    endpoint: String,
    /// The `x-ms-version` sent with every request
    api_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceErrorXml {
    code: String,
    message: Option<String>,
}

impl BlobStorageClient {
    /// Creates a client from a connection string
    pub fn new(connection_string: &str) -> Result<Self> {
        Self::with_context(ConnectionContext::parse(connection_string)?)
    }

    /// Creates a client from the connection string in
    /// `AZURE_STORAGE_CONNECTION_STRING`
    pub fn from_env() -> Result<Self> {
        let connection_string = env::var(CONNECTION_STRING_ENV)
            .map_err(|_| BlobStorageError::required(CONNECTION_STRING_ENV))?;
        Self::new(&connection_string)
    }

    pub fn with_context(context: ConnectionContext) -> Result<Self> {
        let endpoint = context.blob_endpoint()?;
        Ok(Self {
            credential: context.credential(),
            context,
            endpoint,
            api_version: Self::get_api_version(),
        })
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    fn get_api_version() -> String {
        env::var(API_VERSION_ENV).unwrap_or_else(|_| DEFAULT_API_VERSION.to_string())
    }

    /// The URL of a container, without any credentials
    pub fn container_url(&self, container: &str) -> Result<String> {
        Ok(resource_url(&self.endpoint, container, None)?.to_string())
    }

    /// The URL of a blob, without any credentials
    pub fn blob_url(&self, container: &str, blob: &str) -> Result<String> {
        Ok(resource_url(&self.endpoint, container, Some(blob))?.to_string())
    }

    /// A URL that lists the container with a plain GET, authorized by `token`
    pub fn container_listing_url(&self, container: &str, token: &SasToken) -> Result<String> {
        Ok(format!(
            "{}?{}",
            self.container_url(container)?,
            token.with_listing_params()
        ))
    }

    /// Signs a SAS token with this account's key
    pub fn generate_sas(&self, descriptor: &SasDescriptor) -> Result<SasToken> {
        SasTokenBuilder::from_context(&self.context)?.token(descriptor)
    }

    /// Lists the names of all blobs in a container.
    ///
    /// Pages are fetched lazily as the stream is consumed. Names are
    /// returned verbatim, `/` included.
    pub fn list_blobs<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<String>> {
        enum ListState {
            Start,
            HasMore(String),
            Done,
        }

        stream::try_unfold(ListState::Start, move |state| async move {
            let marker = match state {
                ListState::Start => None,
                ListState::HasMore(marker) => Some(marker),
                ListState::Done => return Ok(None),
            };
            let page = self
                .list_blobs_page(
                    container,
                    ListBlobsOptions {
                        marker,
                        ..Default::default()
                    },
                )
                .await?;
            let next_state = match page.next_marker {
                Some(marker) => ListState::HasMore(marker),
                None => ListState::Done,
            };
            let names = page
                .blobs
                .into_iter()
                .map(|blob| -> Result<String> { Ok(blob.name) });
            Ok::<_, BlobStorageError>(Some((stream::iter(names), next_state)))
        })
        .try_flatten()
        .boxed()
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        GLOBAL_CLIENT
            .request(method, url)
            .header(X_MS_VERSION, &self.api_version)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let mut request = request.build()?;
        sign_request(&mut request, &self.credential, Utc::now())?;
        debug!("{} {}", request.method(), request.url().path());
        Ok(GLOBAL_CLIENT.execute(request).await?)
    }

    /// Sends a Put Blob request; `length` must match what `body` yields
    async fn put_block_blob(
        &self,
        container: &str,
        blob: &str,
        body: Body,
        length: u64,
        options: &PutBlobOptions,
    ) -> Result<()> {
        if blob.is_empty() {
            return Err(BlobStorageError::required("blob"));
        }

        let mut request = self
            .request(
                Method::PUT,
                resource_url(&self.endpoint, container, Some(blob))?,
            )
            .header("x-ms-blob-type", "BlockBlob")
            .header(header::CONTENT_LENGTH, length)
            .header(
                header::CONTENT_TYPE,
                options
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            );
        if !options.overwrite {
            request = request.header(header::IF_NONE_MATCH, "*");
        }
        request = request.body(body);

        let response = self.send(request).await?;
        if response.status() != StatusCode::CREATED {
            Err(Self::handle_error(response).await)
        } else {
            Ok(())
        }
    }

    async fn write_acl(&self, container: &str, acl: &ContainerAcl) -> Result<()> {
        let body = policies_to_xml(&acl.policies);
        let mut request = self
            .request(Method::PUT, resource_url(&self.endpoint, container, None)?)
            .query(&[("restype", "container"), ("comp", "acl")])
            .header(header::CONTENT_TYPE, "application/xml")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body);
        if let Some(level) = acl.public_access.header_value() {
            request = request.header(X_MS_BLOB_PUBLIC_ACCESS, level);
        }

        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            Err(match Self::handle_error(response).await {
                BlobStorageError::BadRequest(message) => {
                    BlobStorageError::InvalidPolicyDefinition(message)
                }
                err => err,
            })
        } else {
            Ok(())
        }
    }

    async fn handle_error(response: Response) -> BlobStorageError {
        let status = response.status();
        let header_code = header_str(response.headers(), X_MS_ERROR_CODE).map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let detail = quick_xml::de::from_str::<ServiceErrorXml>(&body).ok();

        let code = header_code.or_else(|| detail.as_ref().map(|d| d.code.clone()));
        let message = detail
            .and_then(|d| d.message)
            .and_then(|m| m.lines().next().map(str::to_string))
            .or_else(|| code.clone())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());

        match code.as_deref() {
            Some("ContainerNotFound") => BlobStorageError::ContainerNotFound(),
            Some("BlobNotFound") | Some("ResourceNotFound") => BlobStorageError::BlobNotFound(),
            Some("ContainerAlreadyExists") => BlobStorageError::ContainerAlreadyExists(),
            Some("BlobAlreadyExists") => BlobStorageError::BlobAlreadyExists(),
            _ if status == StatusCode::FORBIDDEN => BlobStorageError::Forbidden(message),
            _ if status == StatusCode::BAD_REQUEST => BlobStorageError::BadRequest(message),
            None if status == StatusCode::NOT_FOUND => BlobStorageError::BlobNotFound(),
            None => BlobStorageError::unknown_error(status),
            Some(code) => BlobStorageError::ServiceError {
                status: status.as_u16(),
                code: code.to_string(),
                message,
            },
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_date(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_str(headers, name)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn copy_progress(status_code: StatusCode, headers: &HeaderMap) -> Result<CopyProgress> {
    let missing = |name: &str| {
        BlobStorageError::UnknownError(
            status_code.as_u16(),
            format!("response is missing {name}"),
        )
    };
    Ok(CopyProgress {
        copy_id: header_str(headers, X_MS_COPY_ID)
            .ok_or_else(|| missing(X_MS_COPY_ID))?
            .to_string(),
        status: header_str(headers, X_MS_COPY_STATUS)
            .ok_or_else(|| missing(X_MS_COPY_STATUS))?
            .parse()?,
        status_code: status_code.as_u16(),
        description: header_str(headers, "x-ms-copy-status-description").map(str::to_string),
    })
}

/// Functions defined in the Blob service API
#[async_trait]
pub trait BlobStorageApi {
    /// Creates a container
    ///
    /// # Returns
    ///
    /// True if the container was created, false if it already existed
    async fn create_container_if_absent(&self, container: &str) -> Result<bool>;

    /// Deletes a container and every blob in it
    ///
    /// # Returns
    ///
    /// True if the container was deleted, false if it did not exist
    async fn delete_container_if_present(&self, container: &str) -> Result<bool>;

    /// Reads the stored access policies and the public access level
    async fn get_access_policies(&self, container: &str) -> Result<ContainerAcl>;

    /// Replaces the complete list of stored access policies
    ///
    /// The current public access level is read first and written back
    /// unchanged.
    async fn set_policies(&self, container: &str, policies: Vec<AccessPolicy>) -> Result<()>;

    /// Removes one stored access policy by id
    ///
    /// # Returns
    ///
    /// True if a policy was removed.  When no policy has the id nothing is
    /// written and false is returned.
    async fn remove_policy_if_present(&self, container: &str, policy_id: &str) -> Result<bool>;

    /// Changes anonymous access to the container, keeping its policies
    async fn set_public_access_level(
        &self,
        container: &str,
        level: PublicAccessLevel,
    ) -> Result<()>;

    /// Uploads an in-memory body as a block blob
    async fn put_blob(
        &self,
        container: &str,
        blob: &str,
        body: Bytes,
        options: PutBlobOptions,
    ) -> Result<()>;

    /// Uploads a local file as a block blob
    ///
    /// # Arguments
    ///
    /// * `source` - The file to read
    /// * `overwrite` - If false the upload fails with
    ///                 [`BlobStorageError::BlobAlreadyExists`] when the blob
    ///                 exists
    async fn upload_blob(
        &self,
        container: &str,
        blob: &str,
        source: &Path,
        overwrite: bool,
    ) -> Result<()>;

    /// Downloads a blob, or a range of it, into memory
    async fn download(
        &self,
        container: &str,
        blob: &str,
        options: DownloadOptions,
    ) -> Result<Bytes>;

    /// Downloads a blob into a local file, creating or truncating it
    ///
    /// # Returns
    ///
    /// The number of bytes written
    async fn download_blob(&self, container: &str, blob: &str, destination: &Path)
        -> Result<u64>;

    /// Deletes a blob
    ///
    /// # Returns
    ///
    /// True if the blob was deleted, false if it did not exist
    async fn delete_blob_if_present(&self, container: &str, blob: &str) -> Result<bool>;

    /// Reads a blob's system properties
    async fn get_properties(&self, container: &str, blob: &str) -> Result<BlobProperties>;

    /// Lists one page of blobs
    async fn list_blobs_page(
        &self,
        container: &str,
        options: ListBlobsOptions,
    ) -> Result<ListBlobsPage>;

    /// Copies `source` onto `destination` and waits for the copy to finish
    ///
    /// # Arguments
    ///
    /// * `source` - A blob URL the service can read, sent verbatim.  It may
    ///              carry its own SAS token.
    /// * `destination` - A blob URL in this client's account
    /// * `options` - Polling interval, timeout and cancellation
    ///
    /// # Returns
    ///
    /// The outcome of the copy.  A copy that fails on the service side is
    /// returned with `succeeded` set to false.
    async fn start_and_await_copy(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<CopyResult>;

    /// Aborts a pending copy, leaving an empty destination blob
    async fn abort_copy(&self, container: &str, blob: &str, copy_id: &str) -> Result<()>;
}

/// Options for the put operation
#[derive(Clone, Debug)]
pub struct PutBlobOptions {
    /// If false the put fails when the blob already exists
    pub overwrite: bool,
    /// Specify the content type of the blob
    /// If not specified the content type will be application/octet-stream
    pub content_type: Option<String>,
}

impl Default for PutBlobOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            content_type: None,
        }
    }
}

/// Options for the download operation
#[derive(Clone, Debug, Default)]
pub struct DownloadOptions {
    /// The range of bytes to download.  If not specified then the entire blob
    /// is downloaded.  The start of the range must be less than the # of bytes
    /// in the blob or an error will be returned.  The end of the range may be
    /// greater than the number of bytes in the blob.
    pub byte_range: Option<Range<usize>>,
}

/// Options for the list operation
///
/// If `max_results` is reached the page has `next_marker` set and it can be
/// passed back as `marker` to get the next page of results.
#[derive(Clone, Debug, Default)]
pub struct ListBlobsOptions {
    /// Only list blobs whose names start with this prefix
    pub prefix: Option<String>,
    /// A marker (returned from a previous list call) used to page results
    pub marker: Option<String>,
    /// The maximum number of results to return
    pub max_results: Option<u32>,
}

/// One page of a container listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListBlobsPage {
    pub blobs: Vec<BlobItem>,
    /// Present when more results are available
    pub next_marker: Option<String>,
}

/// A blob as it appears in a listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobItem {
    pub name: String,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// System properties of a blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobsXml,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobsXml {
    #[serde(rename = "Blob", default)]
    blobs: Vec<BlobXml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobXml {
    name: String,
    #[serde(default)]
    properties: BlobPropertiesXml,
}

#[derive(Debug, Default, Deserialize)]
struct BlobPropertiesXml {
    #[serde(rename = "Last-Modified")]
    last_modified: Option<String>,
    #[serde(rename = "Etag")]
    etag: Option<String>,
    #[serde(rename = "Content-Length")]
    content_length: Option<u64>,
    #[serde(rename = "Content-Type")]
    content_type: Option<String>,
}

impl From<EnumerationResults> for ListBlobsPage {
    fn from(value: EnumerationResults) -> Self {
        Self {
            blobs: value
                .blobs
                .blobs
                .into_iter()
                .map(|blob| BlobItem {
                    name: blob.name,
                    content_length: blob.properties.content_length.unwrap_or(0),
                    content_type: blob.properties.content_type.filter(|s| !s.is_empty()),
                    last_modified: blob
                        .properties
                        .last_modified
                        .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    etag: blob.properties.etag,
                })
                .collect(),
            next_marker: value.next_marker.filter(|marker| !marker.is_empty()),
        }
    }
}

#[async_trait]
impl BlobStorageApi for BlobStorageClient {
    async fn create_container_if_absent(&self, container: &str) -> Result<bool> {
        let request = self
            .request(Method::PUT, resource_url(&self.endpoint, container, None)?)
            .query(&[("restype", "container")]);

        let response = self.send(request).await?;
        if response.status() == StatusCode::CREATED {
            return Ok(true);
        }
        match Self::handle_error(response).await {
            BlobStorageError::ContainerAlreadyExists() => Ok(false),
            err => Err(err),
        }
    }

    async fn delete_container_if_present(&self, container: &str) -> Result<bool> {
        let request = self
            .request(Method::DELETE, resource_url(&self.endpoint, container, None)?)
            .query(&[("restype", "container")]);

        let response = self.send(request).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(true);
        }
        match Self::handle_error(response).await {
            err if err.is_not_found() => Ok(false),
            err => Err(err),
        }
    }

    async fn get_access_policies(&self, container: &str) -> Result<ContainerAcl> {
        let request = self
            .request(Method::GET, resource_url(&self.endpoint, container, None)?)
            .query(&[("restype", "container"), ("comp", "acl")]);

        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::handle_error(response).await);
        }
        let public_access =
            PublicAccessLevel::from_header(header_str(response.headers(), X_MS_BLOB_PUBLIC_ACCESS));
        let body = response.text().await?;
        Ok(ContainerAcl {
            public_access,
            policies: policies_from_xml(&body)?,
        })
    }

    async fn set_policies(&self, container: &str, policies: Vec<AccessPolicy>) -> Result<()> {
        let current = self.get_access_policies(container).await?;
        self.write_acl(
            container,
            &ContainerAcl {
                public_access: current.public_access,
                policies,
            },
        )
        .await
    }

    async fn remove_policy_if_present(&self, container: &str, policy_id: &str) -> Result<bool> {
        let mut acl = self.get_access_policies(container).await?;
        let before = acl.policies.len();
        acl.policies.retain(|policy| policy.id != policy_id);
        if acl.policies.len() == before {
            debug!("no policy {policy_id} on container {container}");
            return Ok(false);
        }
        self.write_acl(container, &acl).await?;
        Ok(true)
    }

    async fn set_public_access_level(
        &self,
        container: &str,
        level: PublicAccessLevel,
    ) -> Result<()> {
        let mut acl = self.get_access_policies(container).await?;
        acl.public_access = level;
        self.write_acl(container, &acl).await
    }

    async fn put_blob(
        &self,
        container: &str,
        blob: &str,
        body: Bytes,
        options: PutBlobOptions,
    ) -> Result<()> {
        let length = body.len() as u64;
        self.put_block_blob(container, blob, Body::from(body), length, &options)
            .await
    }

    async fn upload_blob(
        &self,
        container: &str,
        blob: &str,
        source: &Path,
        overwrite: bool,
    ) -> Result<()> {
        let file = File::open(source).await?;
        let length = file.metadata().await?.len();
        self.put_block_blob(
            container,
            blob,
            Body::wrap_stream(ReaderStream::new(file)),
            length,
            &PutBlobOptions {
                overwrite,
                ..Default::default()
            },
        )
        .await
    }

    async fn download(
        &self,
        container: &str,
        blob: &str,
        options: DownloadOptions,
    ) -> Result<Bytes> {
        let mut request = self.request(
            Method::GET,
            resource_url(&self.endpoint, container, Some(blob))?,
        );

        if let Some(byte_range) = options.byte_range {
            if byte_range.start > byte_range.end {
                return Err(BlobStorageError::InvalidInput(format!(
                    "byte range {}..{} ends before it starts",
                    byte_range.start, byte_range.end
                )));
            }
            if byte_range.start == byte_range.end {
                return Ok(Bytes::new());
            }
            // Need to subtract 1 from byte_range.end because HTTP range headers are inclusive
            // and rust ranges are not.
            request = request.header(
                "x-ms-range",
                format!("bytes={}-{}", byte_range.start, byte_range.end - 1),
            );
        }

        let response = self.send(request).await?;

        if response.status() != StatusCode::OK && response.status() != StatusCode::PARTIAL_CONTENT {
            Err(Self::handle_error(response).await)
        } else {
            Ok(response.bytes().await?)
        }
    }

    async fn download_blob(
        &self,
        container: &str,
        blob: &str,
        destination: &Path,
    ) -> Result<u64> {
        let request = self.request(
            Method::GET,
            resource_url(&self.endpoint, container, Some(blob))?,
        );

        let mut response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::handle_error(response).await);
        }

        let mut file = File::create(destination).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn delete_blob_if_present(&self, container: &str, blob: &str) -> Result<bool> {
        let request = self.request(
            Method::DELETE,
            resource_url(&self.endpoint, container, Some(blob))?,
        );

        let response = self.send(request).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(true);
        }
        match Self::handle_error(response).await {
            err if err.is_not_found() => Ok(false),
            err => Err(err),
        }
    }

    async fn get_properties(&self, container: &str, blob: &str) -> Result<BlobProperties> {
        let request = self.request(
            Method::HEAD,
            resource_url(&self.endpoint, container, Some(blob))?,
        );

        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::handle_error(response).await);
        }

        let headers = response.headers();
        Ok(BlobProperties {
            content_length: header_str(headers, header::CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header_str(headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
            created_at: header_date(headers, "x-ms-creation-time"),
            last_modified: header_date(headers, header::LAST_MODIFIED.as_str()),
            etag: header_str(headers, header::ETAG.as_str()).map(str::to_string),
        })
    }

    async fn list_blobs_page(
        &self,
        container: &str,
        options: ListBlobsOptions,
    ) -> Result<ListBlobsPage> {
        let mut request = self
            .request(Method::GET, resource_url(&self.endpoint, container, None)?)
            .query(&[("restype", "container"), ("comp", "list")]);
        if let Some(prefix) = options.prefix {
            request = request.query(&[("prefix", prefix)]);
        }
        if let Some(marker) = options.marker {
            request = request.query(&[("marker", marker)]);
        }
        if let Some(max_results) = options.max_results {
            request = request.query(&[("maxresults", max_results)]);
        }

        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::handle_error(response).await);
        }
        let body = response.text().await?;
        let results: EnumerationResults = quick_xml::de::from_str(&body)?;
        Ok(results.into())
    }

    async fn start_and_await_copy(
        &self,
        source: &str,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<CopyResult> {
        let destination = BlobUri::parse(destination)?;
        if let Some(account) = self.context.account_name() {
            if destination.account != account {
                return Err(BlobStorageError::InvalidUri(format!(
                    "destination belongs to account {}, not {}",
                    destination.account, account
                )));
            }
        }
        if destination.sas_token.is_some() {
            warn!("ignoring the SAS token on the copy destination; the client credential is used");
        }

        CopyOrchestrator::new(self)
            .start_and_await(source, destination, options)
            .await
    }

    async fn abort_copy(&self, container: &str, blob: &str, copy_id: &str) -> Result<()> {
        let request = self
            .request(
                Method::PUT,
                resource_url(&self.endpoint, container, Some(blob))?,
            )
            .query(&[("comp", "copy"), ("copyid", copy_id)])
            .header("x-ms-copy-action", "abort");

        let response = self.send(request).await?;
        if response.status() != StatusCode::NO_CONTENT {
            Err(Self::handle_error(response).await)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CopyTransport for BlobStorageClient {
    async fn start_copy(&self, source: &str, destination: &BlobUri) -> Result<CopyHandle> {
        let request = self
            .request(
                Method::PUT,
                resource_url(&self.endpoint, &destination.container, Some(&destination.blob))?,
            )
            .header("x-ms-copy-source", source);

        let response = self.send(request).await?;
        if response.status() != StatusCode::ACCEPTED && response.status() != StatusCode::OK {
            return Err(Self::handle_error(response).await);
        }
        let progress = copy_progress(response.status(), response.headers())?;
        Ok(CopyHandle {
            copy_id: progress.copy_id.clone(),
            progress,
        })
    }

    async fn copy_status(&self, destination: &BlobUri) -> Result<CopyProgress> {
        let request = self.request(
            Method::HEAD,
            resource_url(&self.endpoint, &destination.container, Some(&destination.blob))?,
        );

        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::handle_error(response).await);
        }
        copy_progress(response.status(), response.headers())
    }
}
