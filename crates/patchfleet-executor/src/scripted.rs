use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use patchfleet_core::{Component, PatchError};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::traits::{
    AuthProtocol, CommandOutput, Credential, HostControl, Inventory, RemoteChannel, RemoteCommand,
    Transport,
};

const PASSWORD_ENV: &str = "PATCHFLEET_PASSWORD";
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Command lines backing each collaborator operation.
///
/// Each template is split on whitespace into a program and its arguments
/// (no shell is involved), then `{host}`, `{protocol}`, `{command}`,
/// `{source}`, `{destination}` and `{username}` are substituted per
/// argument. The password is passed in `PATCHFLEET_PASSWORD`, never on the
/// command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTemplates {
    /// Prints a JSON array of components.
    pub inventory: Option<String>,
    /// Prints `true` or `false`.
    pub pending_reboot: Option<String>,
    pub restart: Option<String>,
    /// Exits 0 once the host answers.
    pub probe: Option<String>,
    /// Exits 0 when a session with `{protocol}` can be opened.
    pub connect: Option<String>,
    pub configure_credssp: Option<String>,
    /// Runs `{command}` on the host and exits with its exit code.
    pub execute: Option<String>,
    pub copy: Option<String>,
}

/// A backend that shells out to operator-provided commands.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    templates: Arc<CommandTemplates>,
    command_timeout: Duration,
    poll_interval: Duration,
}

impl ScriptedBackend {
    pub fn new(templates: CommandTemplates) -> Self {
        Self {
            templates: Arc::new(templates),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn run(
        &self,
        name: &str,
        template: Option<&str>,
        vars: &BTreeMap<&str, String>,
        credential: &Credential,
    ) -> Result<CommandOutput, String> {
        let template = template.ok_or_else(|| format!("no [backend] {name} command is configured"))?;
        let argv = render_template(template, vars);
        let Some((program, args)) = argv.split_first() else {
            return Err(format!("[backend] {name} command is empty"));
        };

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(password) = credential.password() {
            command.env(PASSWORD_ENV, password);
        }

        debug!(command = name, program = %program, "running backend command");
        let output = tokio::time::timeout(self.command_timeout, command.output())
            .await
            .map_err(|_| {
                format!(
                    "{name} command timed out after {}s",
                    self.command_timeout.as_secs()
                )
            })?
            .map_err(|err| format!("failed to start {name} command '{program}': {err}"))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`Self::run`], but a non-zero exit is an error.
    async fn run_checked(
        &self,
        name: &str,
        template: Option<&str>,
        vars: &BTreeMap<&str, String>,
        credential: &Credential,
    ) -> Result<CommandOutput, String> {
        let output = self.run(name, template, vars, credential).await?;
        if output.exit_code != 0 {
            return Err(format!(
                "{name} command exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(output)
    }
}

pub(crate) fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> Vec<String> {
    template
        .split_whitespace()
        .map(|part| render_part(part, vars))
        .collect()
}

/// Single pass, so substituted values are never expanded again.
fn render_part(part: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut rendered = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if vars.contains_key(&after[..close]) => {
                rendered.push_str(&vars[&after[..close]]);
                rest = &after[close + 1..];
            }
            _ => {
                rendered.push('{');
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

fn host_vars(host: &str, credential: &Credential) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("host", host.to_string());
    vars.insert("username", credential.username.clone().unwrap_or_default());
    vars
}

/// `C:\Temp` + `x.exe` keeps the host's separator style.
fn remote_join(remote_dir: &str, file_name: &str) -> String {
    let separator = if remote_dir.contains('\\') { '\\' } else { '/' };
    format!(
        "{}{separator}{file_name}",
        remote_dir.trim_end_matches(['\\', '/'])
    )
}

#[async_trait]
impl Inventory for ScriptedBackend {
    async fn collect_components(
        &self,
        host: &str,
        credential: &Credential,
    ) -> Result<Vec<Component>, PatchError> {
        let vars = host_vars(host, credential);
        let output = self
            .run_checked("inventory", self.templates.inventory.as_deref(), &vars, credential)
            .await
            .map_err(|err| PatchError::Connection(format!("{host}: {err}")))?;
        serde_json::from_str(output.stdout.trim()).map_err(|err| {
            PatchError::Connection(format!("{host}: inventory output is not a component list: {err}"))
        })
    }
}

#[async_trait]
impl HostControl for ScriptedBackend {
    async fn pending_reboot(&self, host: &str, credential: &Credential) -> Result<bool, PatchError> {
        let vars = host_vars(host, credential);
        let output = self
            .run_checked(
                "pending_reboot",
                self.templates.pending_reboot.as_deref(),
                &vars,
                credential,
            )
            .await
            .map_err(|err| PatchError::Check(format!("{host}: {err}")))?;
        match output.stdout.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(PatchError::Check(format!(
                "{host}: pending_reboot printed '{other}', expected true or false"
            ))),
        }
    }

    async fn restart(&self, host: &str, credential: &Credential) -> Result<(), PatchError> {
        let vars = host_vars(host, credential);
        self.run_checked("restart", self.templates.restart.as_deref(), &vars, credential)
            .await
            .map(|_| ())
            .map_err(|err| PatchError::Restart(format!("{host}: {err}")))
    }

    async fn wait_until_reachable(&self, host: &str, timeout: Duration) -> bool {
        let credential = Credential::current_user();
        let vars = host_vars(host, &credential);
        let deadline = Instant::now() + timeout;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self
                .run("probe", self.templates.probe.as_deref(), &vars, &credential)
                .await
            {
                Ok(output) if output.exit_code == 0 => return true,
                Ok(_) => {}
                Err(err) => {
                    warn!(host, error = %err, "reachability probe unavailable");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    async fn copy_file(
        &self,
        host: &str,
        credential: &Credential,
        local_path: &Path,
        remote_dir: &str,
    ) -> Result<String, PatchError> {
        let file_name = local_path
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| {
                PatchError::Copy(format!("invalid installer path {}", local_path.display()))
            })?;
        let destination = remote_join(remote_dir, file_name);

        let mut vars = host_vars(host, credential);
        vars.insert("source", local_path.display().to_string());
        vars.insert("destination", destination.clone());
        self.run_checked("copy", self.templates.copy.as_deref(), &vars, credential)
            .await
            .map_err(|err| PatchError::Copy(format!("{host}: {err}")))?;
        Ok(destination)
    }
}

#[async_trait]
impl Transport for ScriptedBackend {
    async fn connect(
        &self,
        host: &str,
        credential: &Credential,
        protocol: AuthProtocol,
    ) -> Result<Box<dyn RemoteChannel>, PatchError> {
        if self.templates.connect.is_some() {
            let mut vars = host_vars(host, credential);
            vars.insert("protocol", protocol.to_string());
            self.run_checked("connect", self.templates.connect.as_deref(), &vars, credential)
                .await
                .map_err(|err| PatchError::Auth(format!("{host} over {protocol}: {err}")))?;
        }

        Ok(Box::new(ScriptedChannel {
            backend: self.clone(),
            host: host.to_string(),
            credential: credential.clone(),
            protocol,
        }))
    }

    async fn configure_credssp(&self, host: &str, credential: &Credential) -> Result<(), PatchError> {
        let vars = host_vars(host, credential);
        self.run_checked(
            "configure_credssp",
            self.templates.configure_credssp.as_deref(),
            &vars,
            credential,
        )
        .await
        .map(|_| ())
        .map_err(|err| PatchError::Auth(format!("{host}: {err}")))
    }
}

struct ScriptedChannel {
    backend: ScriptedBackend,
    host: String,
    credential: Credential,
    protocol: AuthProtocol,
}

#[async_trait]
impl RemoteChannel for ScriptedChannel {
    fn protocol(&self) -> AuthProtocol {
        self.protocol
    }

    async fn execute(&self, command: &RemoteCommand) -> Result<CommandOutput, PatchError> {
        let mut vars = host_vars(&self.host, &self.credential);
        vars.insert("protocol", self.protocol.to_string());
        vars.insert("command", command.command_line());
        self.backend
            .run(
                "execute",
                self.backend.templates.execute.as_deref(),
                &vars,
                &self.credential,
            )
            .await
            .map_err(|err| PatchError::Connection(format!("{}: {err}", self.host)))
    }
}
