//! Optimistic concurrency over editable resources.
//!
//! An [`EditSession`] is a pure state machine: clean → dirty → saved or
//! conflict. The save path always passes the version stamp to the caller's
//! save closure as an explicit argument; a force-save runs against the
//! version reported by the server's rejection, which has not yet been
//! committed to session state at that point.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Opaque revision marker carried from read to write. The server is the sole
/// arbiter of whether it still matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionStamp(String);

impl VersionStamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionStamp {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The server's rejection of a stale write: its current version and snapshot,
/// held until the user picks an exit (discard or force).
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictRecord {
    pub local_version: VersionStamp,
    pub server_version: VersionStamp,
    pub server_snapshot: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditState {
    Clean,
    Dirty,
    Conflict,
}

/// How a save attempt ended. A conflict is not an error: it is structured
/// state the UI renders, so it travels in `Ok`.
#[derive(Debug)]
pub enum SaveOutcome {
    Saved(VersionStamp),
    Conflict(ConflictRecord),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no conflict to resolve")]
    NotInConflict,
}

/// Extract the version stamp a write response carries. Writes return the
/// resource including its new stamp; `updated_at` doubles as the version.
pub fn version_from_body(body: &Value) -> Option<VersionStamp> {
    body.get("version")
        .or_else(|| body.get("updated_at"))
        .and_then(Value::as_str)
        .map(VersionStamp::from)
}

/// State machine for one editable resource instance.
pub struct EditSession {
    version: VersionStamp,
    snapshot: Value,
    state: EditState,
    conflict: Option<ConflictRecord>,
}

impl EditSession {
    pub fn new(version: VersionStamp, snapshot: Value) -> Self {
        Self {
            version,
            snapshot,
            state: EditState::Clean,
            conflict: None,
        }
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn version(&self) -> &VersionStamp {
        &self.version
    }

    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn conflict(&self) -> Option<&ConflictRecord> {
        self.conflict.as_ref()
    }

    /// Record a local edit. Editing while a conflict is pending is not
    /// allowed; the conflict must be resolved first.
    pub fn mark_dirty(&mut self) {
        if self.state == EditState::Clean {
            self.state = EditState::Dirty;
        }
    }

    /// Attempt to persist local edits. `save_fn` receives the version the
    /// session read — explicitly, never from ambient state — and returns
    /// either the saved resource body or a conflict record.
    pub async fn save<F, Fut, E>(&mut self, save_fn: F) -> Result<SaveOutcome, E>
    where
        F: FnOnce(VersionStamp) -> Fut,
        Fut: std::future::Future<Output = Result<SaveResult, E>>,
    {
        let attempted = self.version.clone();
        match save_fn(attempted).await? {
            SaveResult::Saved { body } => Ok(self.adopt_saved(body)),
            SaveResult::Conflict(record) => {
                tracing::debug!(
                    target: "campus::resource",
                    local = %record.local_version,
                    server = %record.server_version,
                    "save rejected for stale version"
                );
                self.state = EditState::Conflict;
                self.conflict = Some(record.clone());
                Ok(SaveOutcome::Conflict(record))
            }
        }
    }

    /// Resolve a conflict by dropping local edits: adopt the server's
    /// snapshot and version and return to clean.
    pub fn discard(&mut self) -> Result<(), ResolveError> {
        let record = self.conflict.take().ok_or(ResolveError::NotInConflict)?;
        self.version = record.server_version;
        self.snapshot = record.server_snapshot;
        self.state = EditState::Clean;
        Ok(())
    }

    /// Resolve a conflict by overwriting: re-issue the save carrying the
    /// server's current version. The version is threaded straight from the
    /// conflict record into `save_fn`; session state is only updated once the
    /// server accepts.
    pub async fn force<F, Fut, E>(&mut self, save_fn: F) -> Result<SaveOutcome, ForceError<E>>
    where
        F: FnOnce(VersionStamp) -> Fut,
        Fut: std::future::Future<Output = Result<SaveResult, E>>,
    {
        let record = self
            .conflict
            .clone()
            .ok_or(ForceError::Resolve(ResolveError::NotInConflict))?;
        match save_fn(record.server_version.clone())
            .await
            .map_err(ForceError::Save)?
        {
            SaveResult::Saved { body } => {
                self.conflict = None;
                Ok(self.adopt_saved(body))
            }
            SaveResult::Conflict(fresh) => {
                // A further concurrent write landed between rejection and
                // override; surface the newer record.
                self.conflict = Some(fresh.clone());
                Ok(SaveOutcome::Conflict(fresh))
            }
        }
    }

    fn adopt_saved(&mut self, body: Value) -> SaveOutcome {
        // Always the version the server returned, never the one we guessed.
        let version = version_from_body(&body).unwrap_or_else(|| self.version.clone());
        self.version = version.clone();
        self.snapshot = body;
        self.state = EditState::Clean;
        self.conflict = None;
        SaveOutcome::Saved(version)
    }
}

/// What a save closure reports back: success with the resource body, or the
/// server's conflict rejection.
#[derive(Debug)]
pub enum SaveResult {
    Saved { body: Value },
    Conflict(ConflictRecord),
}

#[derive(Error, Debug)]
pub enum ForceError<E> {
    #[error(transparent)]
    Resolve(ResolveError),
    #[error("force save failed")]
    Save(#[source] E),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_at(version: &str) -> EditSession {
        EditSession::new(
            VersionStamp::from(version),
            json!({"body": "original", "updated_at": version}),
        )
    }

    #[tokio::test]
    async fn save_adopts_server_returned_version() {
        let mut session = session_at("v1");
        session.mark_dirty();

        let outcome = session
            .save(|version| async move {
                assert_eq!(version.as_str(), "v1");
                Ok::<_, Infallible>(SaveResult::Saved {
                    body: json!({"body": "edited", "updated_at": "v2"}),
                })
            })
            .await
            .unwrap();

        assert!(matches!(outcome, SaveOutcome::Saved(v) if v.as_str() == "v2"));
        assert_eq!(session.version().as_str(), "v2");
        assert_eq!(session.state(), EditState::Clean);
    }

    #[tokio::test]
    async fn stale_save_yields_conflict_with_server_version() {
        let mut session = session_at("v1");
        session.mark_dirty();

        let outcome = session
            .save(|version| async move {
                Ok::<_, Infallible>(SaveResult::Conflict(ConflictRecord {
                    local_version: version,
                    server_version: VersionStamp::from("v2"),
                    server_snapshot: json!({"body": "someone else's edit"}),
                }))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, SaveOutcome::Conflict(_)));
        assert_eq!(session.state(), EditState::Conflict);
        let record = session.conflict().unwrap();
        assert_eq!(record.local_version.as_str(), "v1");
        assert_eq!(record.server_version.as_str(), "v2");
    }

    #[tokio::test]
    async fn force_carries_the_servers_current_version() {
        let mut session = session_at("v1");
        session.mark_dirty();

        session
            .save(|version| async move {
                Ok::<_, Infallible>(SaveResult::Conflict(ConflictRecord {
                    local_version: version,
                    server_version: VersionStamp::from("v2"),
                    server_snapshot: json!({"body": "theirs"}),
                }))
            })
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_closure = seen.clone();
        let outcome = session
            .force(move |version| {
                // The override must carry v2 taken from the conflict record,
                // not the stale v1 still held before this call.
                assert_eq!(version.as_str(), "v2");
                seen_in_closure.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, Infallible>(SaveResult::Saved {
                        body: json!({"body": "mine", "updated_at": "v3"}),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, SaveOutcome::Saved(v) if v.as_str() == "v3"));
        assert_eq!(session.version().as_str(), "v3");
        assert_eq!(session.state(), EditState::Clean);
        assert!(session.conflict().is_none());
    }

    #[tokio::test]
    async fn discard_adopts_server_snapshot() {
        let mut session = session_at("v1");
        session.mark_dirty();

        session
            .save(|version| async move {
                Ok::<_, Infallible>(SaveResult::Conflict(ConflictRecord {
                    local_version: version,
                    server_version: VersionStamp::from("v2"),
                    server_snapshot: json!({"body": "theirs", "updated_at": "v2"}),
                }))
            })
            .await
            .unwrap();

        session.discard().unwrap();
        assert_eq!(session.state(), EditState::Clean);
        assert_eq!(session.version().as_str(), "v2");
        assert_eq!(session.snapshot()["body"], "theirs");
    }

    #[test]
    fn discard_without_conflict_is_rejected() {
        let mut session = session_at("v1");
        assert!(matches!(
            session.discard(),
            Err(ResolveError::NotInConflict)
        ));
    }

    #[tokio::test]
    async fn force_surfaces_a_fresh_conflict() {
        let mut session = session_at("v1");
        session.mark_dirty();
        session
            .save(|version| async move {
                Ok::<_, Infallible>(SaveResult::Conflict(ConflictRecord {
                    local_version: version,
                    server_version: VersionStamp::from("v2"),
                    server_snapshot: json!({}),
                }))
            })
            .await
            .unwrap();

        let outcome = session
            .force(|version| async move {
                Ok::<_, Infallible>(SaveResult::Conflict(ConflictRecord {
                    local_version: version,
                    server_version: VersionStamp::from("v4"),
                    server_snapshot: json!({}),
                }))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, SaveOutcome::Conflict(ref r) if r.server_version.as_str() == "v4"));
        assert_eq!(session.state(), EditState::Conflict);
    }

    #[test]
    fn version_from_body_prefers_explicit_version_field() {
        let body = json!({"version": "ver-9", "updated_at": "2026-01-01T00:00:00Z"});
        assert_eq!(version_from_body(&body).unwrap().as_str(), "ver-9");

        let body = json!({"updated_at": "2026-01-01T00:00:00Z"});
        assert_eq!(
            version_from_body(&body).unwrap().as_str(),
            "2026-01-01T00:00:00Z"
        );

        assert!(version_from_body(&json!({"body": "x"})).is_none());
    }
}
