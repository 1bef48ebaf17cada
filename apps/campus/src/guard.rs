//! Navigation guard for forms with uncommitted input.
//!
//! The dirty predicate is re-evaluated on every check, so a successful
//! submission that flips it to false before navigating is never self-blocked
//! by its own guard.

/// Outcome of a navigation attempt against the guard.
pub enum NavigationCheck {
    /// Nothing unsaved; the navigation proceeds.
    Proceed { target: String },
    /// Unsaved input; the caller must confirm or cancel.
    Confirm(PendingNavigation),
}

/// A navigation attempt held pending the user's decision.
pub struct PendingNavigation {
    target: String,
    message: String,
}

impl PendingNavigation {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The human-readable warning to present.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Proceed with the navigation that was attempted.
    pub fn confirm(self) -> String {
        self.target
    }

    /// Abort; focus returns to the form.
    pub fn cancel(self) {}
}

pub struct UnsavedChangesGuard {
    dirty: Box<dyn Fn() -> bool + Send + Sync>,
    message: String,
}

impl UnsavedChangesGuard {
    pub fn new<F>(message: impl Into<String>, dirty: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            dirty: Box::new(dirty),
            message: message.into(),
        }
    }

    /// Intercept an in-app navigation attempt.
    pub fn check(&self, target: impl Into<String>) -> NavigationCheck {
        let target = target.into();
        if (self.dirty)() {
            NavigationCheck::Confirm(PendingNavigation {
                target,
                message: self.message.clone(),
            })
        } else {
            NavigationCheck::Proceed { target }
        }
    }

    /// Intercept a close/reload attempt: the platform-native prompt fires
    /// only while the form is dirty.
    pub fn before_close(&self) -> Option<&str> {
        if (self.dirty)() {
            Some(&self.message)
        } else {
            None
        }
    }
}
