use std::sync::Arc;

use patchfleet_core::{ErrorKind, PatchError};
use tracing::warn;

use crate::traits::{Credential, HostControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// A reboot is pending but the run resumes a previous one; the first
    /// action goes ahead anyway.
    ProceedDespitePending,
    RestartFirst,
}

/// Checks for a pending reboot before each action.
#[derive(Clone)]
pub struct RebootGate {
    host_control: Arc<dyn HostControl>,
    restart_enabled: bool,
}

impl RebootGate {
    pub fn new(host_control: Arc<dyn HostControl>, restart_enabled: bool) -> Self {
        Self {
            host_control,
            restart_enabled,
        }
    }

    pub async fn check(
        &self,
        host: &str,
        credential: &Credential,
        first_action: bool,
        continue_run: bool,
    ) -> Result<GateDecision, PatchError> {
        let pending = self
            .host_control
            .pending_reboot(host, credential)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::Check => err,
                _ => PatchError::Check(format!("{host}: {err}")),
            })?;

        let decision = decide(pending, self.restart_enabled, first_action && continue_run);
        if decision == Some(GateDecision::ProceedDespitePending) {
            warn!(host, "reboot pending; continuing a previous run without restarting");
        }
        decision.ok_or_else(|| {
            PatchError::PendingReboot(format!(
                "{host} has a reboot pending and automatic restart is disabled"
            ))
        })
    }
}

/// `None` means the host must not be touched.
pub(crate) fn decide(pending: bool, restart_enabled: bool, resuming: bool) -> Option<GateDecision> {
    match (pending, restart_enabled, resuming) {
        (false, _, _) => Some(GateDecision::Proceed),
        (true, true, _) => Some(GateDecision::RestartFirst),
        (true, false, true) => Some(GateDecision::ProceedDespitePending),
        (true, false, false) => None,
    }
}
