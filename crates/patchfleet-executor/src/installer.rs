use std::path::Path;

use patchfleet_core::{PatchError, UpdateAction};
use tracing::info;

use crate::traits::{CommandOutput, RemoteChannel, RemoteCommand};

pub const INSTALLER_ARGS: [&str; 3] = ["/quiet", "/allinstances", "/IAcceptSQLServerLicenseTerms"];

const EXIT_SUCCESS: i32 = 0;
const EXIT_RESTART_REQUIRED: i32 = 3010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Completed,
    RestartRequired,
}

pub fn installer_command(remote_path: &str) -> RemoteCommand {
    RemoteCommand {
        program: remote_path.to_string(),
        args: INSTALLER_ARGS.iter().map(|arg| arg.to_string()).collect(),
    }
}

/// `\\server\share\...` media is read in place by the host.
pub fn is_unc_path(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text.starts_with(r"\\") || text.starts_with("//")
}

pub fn interpret_exit(action: &UpdateAction, output: &CommandOutput) -> Result<InstallOutcome, PatchError> {
    match output.exit_code {
        EXIT_SUCCESS => Ok(InstallOutcome::Completed),
        EXIT_RESTART_REQUIRED => Ok(InstallOutcome::RestartRequired),
        code => {
            let detail = [output.stderr.trim(), output.stdout.trim()]
                .into_iter()
                .find(|text| !text.is_empty())
                .unwrap_or("no output");
            Err(PatchError::Install(format!(
                "{} exited with code {code}: {detail}",
                action.kb_label()
            )))
        }
    }
}

pub async fn run_installer(
    channel: &dyn RemoteChannel,
    host: &str,
    remote_path: &str,
    action: &UpdateAction,
) -> Result<InstallOutcome, PatchError> {
    let command = installer_command(remote_path);
    info!(host, kb = action.kb, target = %action.target_version, "running installer");
    let output = channel.execute(&command).await?;
    interpret_exit(action, &output)
}
