//! [Azure Blob Storage](https://learn.microsoft.com/en-us/rest/api/storageservices/blob-service-rest-api)
//! stores unstructured data in containers of named blobs.
//!
//! This crate supplies a rust client for the parts of the REST API needed to
//! manage containers and blobs, their stored access policies, shared access
//! signatures, and server-side copies.
//!
//! To use the client all you need is a connection string, either passed in
//! directly or read from `AZURE_STORAGE_CONNECTION_STRING`:
//!
//! [`BlobStorageClient`]: crate::client::BlobStorageClient
//!
//! ```ignore
//!
//! let client = BlobStorageClient::from_env()?;
//!
//! client.create_container_if_absent("photos").await?;
//! client
//!     .upload_blob("photos", "folder1/cat.jpg", Path::new("cat.jpg"), true)
//!     .await?;
//!
//! let mut names = client.list_blobs("photos");
//! while let Some(name) = names.try_next().await? {
//!     dbg!(name);
//! }
//! ```
//!
//! A SAS token grants time-limited access to one blob or container without
//! sharing the account key.  Tokens are signed locally, so no request is made:
//!
//! ```ignore
//! let token = client.generate_sas(
//!     &SasDescriptor::blob("photos", "folder1/cat.jpg")
//!         .with_permissions(SasPermissions::read_only())
//!         .with_window(SasWindow::starting_at(Utc::now(), Duration::hours(1))),
//! )?;
//! let url = token.append_to(&client.blob_url("photos", "folder1/cat.jpg")?);
//! ```
//!
//! Copies run on the service.  [`start_and_await_copy`] starts one and polls
//! until it finishes, times out, or is cancelled:
//!
//! [`start_and_await_copy`]: crate::client::BlobStorageApi::start_and_await_copy
//!
//! ```ignore
//! let result = client
//!     .start_and_await_copy(&source_url, &destination_url, &CopyOptions::default())
//!     .await?
//!     .into_result()?;
//! println!("copied in {} polls", result.polls);
//! ```

pub mod auth;
pub mod client;
pub mod connection;
pub mod copy;
pub mod error;
pub mod policy;
pub mod sas;
pub mod uri;
