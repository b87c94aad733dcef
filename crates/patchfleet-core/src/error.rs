use std::fmt;

/// Error taxonomy of the patch engine.
///
/// Everything except a reference load failure with no fallback is scoped to
/// a single host: the coordinator records it against that host and keeps
/// going with the rest of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("build reference could not be loaded: {0}")]
    Load(String),

    #[error("build reference refresh failed: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("reboot pending: {0}")]
    PendingReboot(String),

    #[error("pending reboot check failed: {0}")]
    Check(String),

    #[error("restart failed: {0}")]
    Restart(String),

    #[error("host did not become reachable: {0}")]
    NotReachable(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("copy failed: {0}")]
    Copy(String),

    #[error("installer failed: {0}")]
    Install(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Load,
    Network,
    NotFound,
    Planning,
    Auth,
    Connection,
    PendingReboot,
    Check,
    Restart,
    NotReachable,
    Download,
    Copy,
    Install,
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Load(_) => ErrorKind::Load,
            Self::Network(_) => ErrorKind::Network,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Planning(_) => ErrorKind::Planning,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Connection(_) => ErrorKind::Connection,
            Self::PendingReboot(_) => ErrorKind::PendingReboot,
            Self::Check(_) => ErrorKind::Check,
            Self::Restart(_) => ErrorKind::Restart,
            Self::NotReachable(_) => ErrorKind::NotReachable,
            Self::Download(_) => ErrorKind::Download,
            Self::Copy(_) => ErrorKind::Copy,
            Self::Install(_) => ErrorKind::Install,
        }
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load-error",
            Self::Network => "network-error",
            Self::NotFound => "not-found",
            Self::Planning => "planning-error",
            Self::Auth => "auth-error",
            Self::Connection => "connection-error",
            Self::PendingReboot => "pending-reboot",
            Self::Check => "check-error",
            Self::Restart => "restart-error",
            Self::NotReachable => "not-reachable",
            Self::Download => "download-error",
            Self::Copy => "copy-error",
            Self::Install => "install-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
