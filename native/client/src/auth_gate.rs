//! Auth Gate: the only surface the surrounding login/logout flow sees.
//! Reconciliation hiccups are logged and never block a login — except
//! `CoreError::StorageUnavailable`, which is fatal to the core and is
//! re-raised to the caller instead of swallowed.

use crate::error::CoreError;
use crate::reconciler::BundleReconciler;
use crate::session_manager::SessionManager;
use tracing::warn;

pub struct AuthGate<'a> {
    reconciler: &'a BundleReconciler,
    sessions: &'a SessionManager,
}

impl<'a> AuthGate<'a> {
    pub fn new(reconciler: &'a BundleReconciler, sessions: &'a SessionManager) -> Self {
        Self {
            reconciler,
            sessions,
        }
    }

    pub async fn on_authenticated(&self) -> Result<(), CoreError> {
        if let Err(err) = self.reconciler.initialize().await {
            if matches!(err, CoreError::StorageUnavailable(_)) {
                return Err(err);
            }
            warn!(error = %err, "bundle reconciliation failed during login");
        }
        if let Err(err) = self.reconciler.check_and_replenish().await {
            if matches!(err, CoreError::StorageUnavailable(_)) {
                return Err(err);
            }
            warn!(error = %err, "one-time prekey replenishment failed during login");
        }
        Ok(())
    }

    pub async fn on_logout(&self) {
        if let Err(err) = self.sessions.clear_all().await {
            warn!(error = %err, "failed to clear cached sessions on logout");
        }
    }
}
