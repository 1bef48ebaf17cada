//! One user-initiated write, coordinated: failure classification, retained
//! payload, user-triggered retry.
//!
//! Retry is always an explicit act — the payload is user-authored content, so
//! nothing here re-submits automatically and there is no backoff schedule.
//! The original payload is kept verbatim across retries; a second submission
//! while one is outstanding is rejected, not queued.

use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::api::{ApiError, ValidationErrors};
use crate::resource::ConflictRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Validation,
    Conflict,
    Server,
}

/// A classified submission failure, kept as structured state for the UI.
#[derive(Clone, Debug, Error)]
pub enum SubmitFailure {
    /// The call never reached the server. Retryable; input preserved.
    #[error("network failure: {0}")]
    Network(String),
    /// The server rejected the payload's content. Field-level; no retry
    /// control, the user edits and resubmits.
    #[error("validation rejected: {0}")]
    Validation(ValidationErrors),
    /// Version mismatch; resolved by the concurrency resolver, not retried
    /// here.
    #[error("conflicting edit (server holds {})", .0.server_version)]
    Conflict(ConflictRecord),
    /// 5xx or anything else the user cannot fix. Only an opaque reference
    /// id is surfaced.
    #[error("server error (reference {reference})")]
    Server { reference: String },
}

impl SubmitFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            SubmitFailure::Network(_) => FailureClass::Network,
            SubmitFailure::Validation(_) => FailureClass::Validation,
            SubmitFailure::Conflict(_) => FailureClass::Conflict,
            SubmitFailure::Server { .. } => FailureClass::Server,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitFailure::Network(_))
    }

    fn from_api(err: ApiError) -> Self {
        match err {
            ApiError::Network(message) => SubmitFailure::Network(message),
            ApiError::Aborted => SubmitFailure::Network("request aborted".into()),
            ApiError::Validation(errors) => SubmitFailure::Validation(errors),
            ApiError::Conflict(record) => SubmitFailure::Conflict(record),
            ApiError::Server { reference } => SubmitFailure::Server { reference },
            other => {
                // Unauthorized, unexpected statuses, malformed responses:
                // user-facing they are all "the server failed"; the detail
                // stays in the log next to the reference id.
                let reference = Uuid::new_v4().to_string();
                tracing::warn!(
                    target: "campus::submit",
                    reference = %reference,
                    error = %other,
                    "submission failed outside the retryable classes"
                );
                SubmitFailure::Server { reference }
            }
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum SubmitError {
    #[error("a submission is already in flight")]
    AlreadyInFlight,
    #[error("no failed submission to retry")]
    NothingToRetry,
    #[error("the last failure cannot be retried")]
    NotRetryable,
    #[error(transparent)]
    Failed(#[from] SubmitFailure),
}

type PerformFn<P> =
    Arc<dyn Fn(P) -> Pin<Box<dyn Future<Output = Result<Value, ApiError>> + Send>> + Send + Sync>;

struct Attempt<P> {
    payload: P,
    perform: PerformFn<P>,
    retry_count: u32,
}

struct CoordinatorState<P> {
    attempt: Option<Attempt<P>>,
    failure: Option<SubmitFailure>,
}

/// Coordinates one logical write for one form instance. Scoped per page;
/// a failure here never touches another page's state.
pub struct SubmissionCoordinator<P> {
    submitting: AtomicBool,
    state: Mutex<CoordinatorState<P>>,
}

impl<P: Clone + Send + Sync + 'static> SubmissionCoordinator<P> {
    pub fn new() -> Self {
        Self {
            submitting: AtomicBool::new(false),
            state: Mutex::new(CoordinatorState {
                attempt: None,
                failure: None,
            }),
        }
    }

    /// Asserted for the full duration of a submission or retry.
    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    pub fn last_failure(&self) -> Option<SubmitFailure> {
        self.state.lock().failure.clone()
    }

    /// The retained payload of a failed attempt, exactly as submitted.
    pub fn pending_payload(&self) -> Option<P> {
        self.state
            .lock()
            .attempt
            .as_ref()
            .map(|attempt| attempt.payload.clone())
    }

    pub fn retry_count(&self) -> u32 {
        self.state
            .lock()
            .attempt
            .as_ref()
            .map(|attempt| attempt.retry_count)
            .unwrap_or(0)
    }

    /// Abandon the failed attempt and its error state.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.attempt = None;
        state.failure = None;
    }

    /// Run `perform` against `payload`. On failure the payload and the
    /// closure are retained so [`retry`](Self::retry) can re-issue the
    /// identical write.
    pub async fn submit<F, Fut>(&self, payload: P, perform: F) -> Result<Value, SubmitError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        if self.submitting.swap(true, Ordering::SeqCst) {
            return Err(SubmitError::AlreadyInFlight);
        }
        let perform: PerformFn<P> = Arc::new(move |payload| Box::pin(perform(payload)));
        let result = self.drive(payload, perform, 0).await;
        self.submitting.store(false, Ordering::SeqCst);
        result
    }

    /// Re-issue the retained write. Only valid after a network-classified
    /// failure, and only ever user-triggered.
    pub async fn retry(&self) -> Result<Value, SubmitError> {
        if self.submitting.swap(true, Ordering::SeqCst) {
            return Err(SubmitError::AlreadyInFlight);
        }
        let staged = {
            let state = self.state.lock();
            match (&state.attempt, &state.failure) {
                (Some(attempt), Some(failure)) if failure.is_retryable() => Ok((
                    attempt.payload.clone(),
                    attempt.perform.clone(),
                    attempt.retry_count + 1,
                )),
                (Some(_), Some(_)) => Err(SubmitError::NotRetryable),
                _ => Err(SubmitError::NothingToRetry),
            }
        };
        let result = match staged {
            Ok((payload, perform, retry_count)) => self.drive(payload, perform, retry_count).await,
            Err(err) => Err(err),
        };
        self.submitting.store(false, Ordering::SeqCst);
        result
    }

    async fn drive(
        &self,
        payload: P,
        perform: PerformFn<P>,
        retry_count: u32,
    ) -> Result<Value, SubmitError> {
        match perform(payload.clone()).await {
            Ok(body) => {
                let mut state = self.state.lock();
                state.attempt = None;
                state.failure = None;
                Ok(body)
            }
            Err(err) => {
                let failure = SubmitFailure::from_api(err);
                tracing::debug!(
                    target: "campus::submit",
                    class = ?failure.class(),
                    retry_count,
                    "submission failed"
                );
                let mut state = self.state.lock();
                state.failure = Some(failure.clone());
                state.attempt = Some(Attempt {
                    payload,
                    perform,
                    retry_count,
                });
                Err(SubmitError::Failed(failure))
            }
        }
    }
}

impl<P: Clone + Send + Sync + 'static> Default for SubmissionCoordinator<P> {
    fn default() -> Self {
        Self::new()
    }
}
