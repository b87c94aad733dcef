use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use patchfleet_core::{Component, PatchError};

/// Remoting authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthProtocol {
    Default,
    Kerberos,
    Negotiate,
    Credssp,
    Basic,
}

impl AuthProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Kerberos => "Kerberos",
            Self::Negotiate => "Negotiate",
            Self::Credssp => "Credssp",
            Self::Basic => "Basic",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "kerberos" => Some(Self::Kerberos),
            "negotiate" => Some(Self::Negotiate),
            "credssp" => Some(Self::Credssp),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }
}

impl fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthProtocol {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            format!("unknown protocol '{value}' (expected Default, Kerberos, Negotiate, Credssp or Basic)")
        })
    }
}

/// Account used against every host of a run.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub username: Option<String>,
    password: Option<String>,
}

impl Credential {
    /// The identity of the current process.
    pub fn current_user() -> Self {
        Self::default()
    }

    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: Some(username.into()),
            password,
        }
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A program and its arguments, run on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RemoteCommand {
    /// `"program" arg1 arg2`, with the program quoted.
    pub fn command_line(&self) -> String {
        let mut line = format!("\"{}\"", self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Enumerates installed database-engine instances on a host.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn collect_components(
        &self,
        host: &str,
        credential: &Credential,
    ) -> Result<Vec<Component>, PatchError>;
}

/// Host-level operations outside an authenticated channel.
#[async_trait]
pub trait HostControl: Send + Sync {
    async fn pending_reboot(&self, host: &str, credential: &Credential) -> Result<bool, PatchError>;

    async fn restart(&self, host: &str, credential: &Credential) -> Result<(), PatchError>;

    async fn wait_until_reachable(&self, host: &str, timeout: Duration) -> bool;

    /// Copies `local_path` into `remote_dir` and returns the remote path.
    async fn copy_file(
        &self,
        host: &str,
        credential: &Credential,
        local_path: &Path,
        remote_dir: &str,
    ) -> Result<String, PatchError>;
}

/// Opens authenticated channels to hosts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        credential: &Credential,
        protocol: AuthProtocol,
    ) -> Result<Box<dyn RemoteChannel>, PatchError>;

    async fn configure_credssp(&self, host: &str, credential: &Credential) -> Result<(), PatchError>;
}

#[async_trait]
pub trait RemoteChannel: Send + Sync {
    fn protocol(&self) -> AuthProtocol;

    async fn execute(&self, command: &RemoteCommand) -> Result<CommandOutput, PatchError>;
}

/// Decides whether a host may be retried with the fallback protocol.
#[async_trait]
pub trait FallbackApprover: Send + Sync {
    async fn approve(
        &self,
        host: &str,
        primary: AuthProtocol,
        fallback: AuthProtocol,
        error: &PatchError,
    ) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysApprove;

#[async_trait]
impl FallbackApprover for AlwaysApprove {
    async fn approve(&self, _: &str, _: AuthProtocol, _: AuthProtocol, _: &PatchError) -> bool {
        true
    }
}

/// Non-interactive runs: never fall back.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineFallback;

#[async_trait]
impl FallbackApprover for DeclineFallback {
    async fn approve(&self, _: &str, _: AuthProtocol, _: AuthProtocol, _: &PatchError) -> bool {
        false
    }
}

/// The collaborators one run talks to.
#[derive(Clone)]
pub struct Backend {
    pub inventory: Arc<dyn Inventory>,
    pub host_control: Arc<dyn HostControl>,
    pub transport: Arc<dyn Transport>,
}

impl Backend {
    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: Inventory + HostControl + Transport + 'static,
    {
        Self {
            inventory: backend.clone(),
            host_control: backend.clone(),
            transport: backend,
        }
    }
}
