//! Runs planned hosts against remote collaborators: authentication
//! negotiation, the reboot gate, installer runs and throttled fan-out.

mod auth;
mod coordinator;
mod fleet;
mod gate;
mod installer;
mod scripted;
mod traits;

pub use auth::{AuthNegotiator, AuthState, Negotiated};
pub use coordinator::{
    Coordinator, ExecutionOptions, DEFAULT_REMOTE_MEDIA_DIR, DEFAULT_RESTART_TIMEOUT,
    DEFAULT_THROTTLE,
};
pub use fleet::{plan_fleet, PlanRequest};
pub use gate::{GateDecision, RebootGate};
pub use installer::{installer_command, interpret_exit, is_unc_path, InstallOutcome, INSTALLER_ARGS};
pub use scripted::{CommandTemplates, ScriptedBackend};
pub use traits::{
    AlwaysApprove, AuthProtocol, Backend, CommandOutput, Credential, DeclineFallback,
    FallbackApprover, HostControl, Inventory, RemoteChannel, RemoteCommand, Transport,
};

#[cfg(test)]
mod tests;
