//! Error handling utilities for the crate
use std::time::Duration;

use thiserror::Error;

use reqwest::Error as ReqwestError;

/// All errors raised by this crate will be instances of BlobStorageError
#[derive(Error, Debug)]
pub enum BlobStorageError {
    #[error("Malformed connection string: {0}")]
    MalformedConnectionDescriptor(String),
    #[error("The specified container does not exist")]
    ContainerNotFound(),
    #[error("The specified blob does not exist")]
    BlobNotFound(),
    #[error("The specified container already exists")]
    ContainerAlreadyExists(),
    #[error("The specified blob already exists")]
    BlobAlreadyExists(),
    #[error("The service rejected the access policy definition: {0}")]
    InvalidPolicyDefinition(String),
    #[error("A SAS token cannot carry both an explicit time window and a policy id ({0})")]
    SasConflict(String),
    #[error("Copy {copy_id} did not complete within {timeout:?}")]
    CopyTimeout { copy_id: String, timeout: Duration },
    #[error("Copy {copy_id} failed: {detail}")]
    CopyFailed { copy_id: String, detail: String },
    #[error("The operation was cancelled")]
    Cancelled(),
    #[error("Access denied: {0}")]
    Forbidden(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("The service returned {code} ({status}): {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
    },
    #[error("Internal HTTP error: {0}")]
    HttpError(#[from] ReqwestError),
    #[error("Unknown error ({0}): {1}")]
    UnknownError(u16, String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse service response: {0}")]
    InvalidXml(#[from] quick_xml::DeError),
    #[error("Invalid blob URI: {0}")]
    InvalidUri(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BlobStorageError {
    pub fn unknown_error(status_code: reqwest::StatusCode) -> Self {
        BlobStorageError::UnknownError(
            status_code.as_u16(),
            status_code
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
        )
    }

    pub fn required(field_name: &str) -> Self {
        BlobStorageError::InvalidInput(format!("{} is required", field_name))
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        BlobStorageError::MalformedConnectionDescriptor(reason.into())
    }

    /// True for the not-found family that the if-exists operations absorb
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlobStorageError::ContainerNotFound() | BlobStorageError::BlobNotFound()
        )
    }
}

pub(crate) type Result<T> = std::result::Result<T, BlobStorageError>;
