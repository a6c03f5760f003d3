//! Server-side blob copies and the polling loop that waits for them
//!
//! Starting a copy returns as soon as the service has accepted it; the bytes
//! move server-side afterwards. [`CopyOrchestrator`] starts a copy and then
//! polls its status every `poll_interval` until it reaches a terminal state,
//! the timeout runs out, or the caller cancels.
use std::{future::Future, str::FromStr, time::Duration};

use async_trait::async_trait;
use log::{debug, info};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{BlobStorageError, Result},
    uri::BlobUri,
};

/// The copy status the service reports in `x-ms-copy-status`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CopyStatus::Pending)
    }
}

impl FromStr for CopyStatus {
    type Err = BlobStorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CopyStatus::Pending),
            "success" => Ok(CopyStatus::Success),
            "aborted" => Ok(CopyStatus::Aborted),
            "failed" => Ok(CopyStatus::Failed),
            other => Err(BlobStorageError::InvalidInput(format!(
                "unknown copy status: {other}"
            ))),
        }
    }
}

/// What the service returned when the copy was accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyHandle {
    pub copy_id: String,
    pub progress: CopyProgress,
}

/// One observation of a copy's status
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyProgress {
    pub copy_id: String,
    pub status: CopyStatus,
    /// HTTP status of the response that carried this observation
    pub status_code: u16,
    pub description: Option<String>,
}

/// Where a copy operation is in its lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyState {
    NotStarted,
    Pending,
    Succeeded { status_code: u16 },
    Failed { detail: String },
}

impl CopyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CopyState::Succeeded { .. } | CopyState::Failed { .. })
    }
}

/// A single server-side copy, tracked from start to a terminal state.
///
/// Terminal states are final: observations that arrive afterwards are
/// ignored.
#[derive(Clone, Debug)]
pub struct CopyOperation {
    pub source: String,
    pub destination: BlobUri,
    pub copy_id: Option<String>,
    pub state: CopyState,
    /// When the latest status report arrived, on the runtime's clock
    pub last_polled_at: Option<Instant>,
    pub polls: u32,
}

impl CopyOperation {
    pub fn new(source: &str, destination: BlobUri) -> Self {
        Self {
            source: source.to_string(),
            destination,
            copy_id: None,
            state: CopyState::NotStarted,
            last_polled_at: None,
            polls: 0,
        }
    }

    fn started(&mut self, handle: &CopyHandle) {
        self.copy_id = Some(handle.copy_id.clone());
        self.state = CopyState::Pending;
        self.observe(&handle.progress);
    }

    fn polled(&mut self, progress: &CopyProgress, at: Instant) {
        self.polls += 1;
        self.last_polled_at = Some(at);
        self.observe(progress);
    }

    fn observe(&mut self, progress: &CopyProgress) {
        if self.state.is_terminal() {
            return;
        }
        if self.copy_id.as_deref() != Some(progress.copy_id.as_str()) {
            self.state = CopyState::Failed {
                detail: format!("superseded by copy {}", progress.copy_id),
            };
            return;
        }
        self.state = match progress.status {
            CopyStatus::Pending => CopyState::Pending,
            CopyStatus::Success if (200..300).contains(&progress.status_code) => {
                CopyState::Succeeded {
                    status_code: progress.status_code,
                }
            }
            CopyStatus::Success => CopyState::Failed {
                detail: format!("unexpected status code {}", progress.status_code),
            },
            CopyStatus::Aborted | CopyStatus::Failed => CopyState::Failed {
                detail: progress
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", progress.status).to_lowercase()),
            },
        };
    }

    fn result(&self) -> Option<CopyResult> {
        let copy_id = self.copy_id.clone().unwrap_or_default();
        match &self.state {
            CopyState::Succeeded { status_code } => Some(CopyResult {
                copy_id,
                succeeded: true,
                status_code: Some(*status_code),
                error_detail: None,
                polls: self.polls,
            }),
            CopyState::Failed { detail } => Some(CopyResult {
                copy_id,
                succeeded: false,
                status_code: None,
                error_detail: Some(detail.clone()),
                polls: self.polls,
            }),
            CopyState::NotStarted | CopyState::Pending => None,
        }
    }
}

/// The outcome of a copy that reached a terminal state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyResult {
    pub copy_id: String,
    pub succeeded: bool,
    pub status_code: Option<u16>,
    pub error_detail: Option<String>,
    /// Number of status polls issued after the copy was started
    pub polls: u32,
}

impl CopyResult {
    /// Turns a failed copy into [`BlobStorageError::CopyFailed`]
    pub fn into_result(self) -> Result<Self> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(BlobStorageError::CopyFailed {
                copy_id: self.copy_id,
                detail: self.error_detail.unwrap_or_default(),
            })
        }
    }
}

/// Options for waiting on a copy
#[derive(Clone, Debug)]
pub struct CopyOptions {
    /// How long to sleep between status polls
    pub poll_interval: Duration,
    /// Give up (without aborting the copy) once this much time has passed
    /// since the start request was sent. `Duration::MAX` waits forever.
    pub timeout: Duration,
    /// Stops the polling loop early with [`BlobStorageError::Cancelled`]
    pub cancellation: Option<CancellationToken>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            cancellation: None,
        }
    }
}

/// The two remote calls the polling loop needs
#[async_trait]
pub trait CopyTransport: Send + Sync {
    /// Asks the service to copy `source` onto `destination`
    async fn start_copy(&self, source: &str, destination: &BlobUri) -> Result<CopyHandle>;

    /// Reads the current copy status of `destination`
    async fn copy_status(&self, destination: &BlobUri) -> Result<CopyProgress>;
}

/// Drives one copy from start to a terminal state
pub struct CopyOrchestrator<'a, T: CopyTransport + ?Sized> {
    transport: &'a T,
}

impl<'a, T: CopyTransport + ?Sized> CopyOrchestrator<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Starts a copy and waits for it to finish.
    ///
    /// A failed copy is returned as `Ok` with `succeeded == false` and is
    /// never retried. Running out of time yields
    /// [`BlobStorageError::CopyTimeout`] and leaves the copy running on the
    /// service. The timeout bounds every remote call, so a request that never
    /// answers still ends the wait on time.
    pub async fn start_and_await(
        &self,
        source: &str,
        destination: BlobUri,
        options: &CopyOptions,
    ) -> Result<CopyResult> {
        let mut operation = CopyOperation::new(source, destination);
        // A timeout too large to represent means no deadline
        let deadline = Instant::now().checked_add(options.timeout);

        let handle = bounded(
            options,
            deadline,
            "",
            self.transport.start_copy(source, &operation.destination),
        )
        .await?;
        info!(
            "started copy {} onto {}/{}",
            handle.copy_id, operation.destination.container, operation.destination.blob
        );
        operation.started(&handle);

        loop {
            if let Some(result) = operation.result() {
                info!(
                    "copy {} finished after {} polls: succeeded={}",
                    result.copy_id, result.polls, result.succeeded
                );
                return Ok(result);
            }

            if let Some(deadline) = deadline {
                let next_poll = Instant::now().checked_add(options.poll_interval);
                if next_poll.map_or(true, |next_poll| next_poll > deadline) {
                    return Err(BlobStorageError::CopyTimeout {
                        copy_id: handle.copy_id,
                        timeout: options.timeout,
                    });
                }
            }

            let progress = bounded(options, deadline, &handle.copy_id, async {
                sleep(options.poll_interval).await;
                self.transport.copy_status(&operation.destination).await
            })
            .await?;
            debug!("copy {} status: {:?}", handle.copy_id, progress.status);
            operation.polled(&progress, Instant::now());
        }
    }
}

/// Runs one remote step, giving up at the deadline or when cancelled.
///
/// `copy_id` is empty while the service has not acknowledged the copy yet.
async fn bounded<F, O>(
    options: &CopyOptions,
    deadline: Option<Instant>,
    copy_id: &str,
    fut: F,
) -> Result<O>
where
    F: Future<Output = Result<O>>,
{
    let timed = async {
        match deadline {
            Some(deadline) => timeout_at(deadline, fut).await.map_err(|_| {
                BlobStorageError::CopyTimeout {
                    copy_id: copy_id.to_string(),
                    timeout: options.timeout,
                }
            })?,
            None => fut.await,
        }
    };
    cancellable(options.cancellation.as_ref(), timed).await?
}

async fn cancellable<F, O>(token: Option<&CancellationToken>, fut: F) -> Result<O>
where
    F: Future<Output = O>,
{
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(BlobStorageError::Cancelled()),
            out = fut => Ok(out),
        },
        None => Ok(fut.await),
    }
}
