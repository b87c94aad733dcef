use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use patchfleet_core::{Architecture, InstallerPath, PatchError, PlannedHost};
use tracing::{debug, warn};

use crate::download::{DownloadQueue, DownloadRequest};

/// Installer executables found under the configured media repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaIndex {
    installers: Vec<PathBuf>,
    unreadable: Vec<PathBuf>,
}

impl MediaIndex {
    /// Recursively collects every `*.exe` under `roots`, in a stable order.
    /// A directory that cannot be read is logged and skipped; hosts whose
    /// media lived there fall through to downloading.
    pub fn scan(roots: &[PathBuf]) -> Self {
        let mut installers = Vec::new();
        let mut unreadable = Vec::new();
        for root in roots {
            let mut queue: VecDeque<PathBuf> = VecDeque::new();
            queue.push_back(root.clone());

            while let Some(dir) = queue.pop_front() {
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(path = %dir.display(), error = %err, "skipping unreadable media repository");
                        unreadable.push(dir);
                        continue;
                    }
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let Ok(file_type) = entry.file_type() else {
                        continue;
                    };
                    if file_type.is_dir() {
                        queue.push_back(path);
                    } else if file_type.is_file() && is_installer(&path) {
                        installers.push(path);
                    }
                }
            }
        }

        debug!(count = installers.len(), "indexed installer media");
        let mut index = Self::from_paths(installers);
        index.unreadable = unreadable;
        index
    }

    pub fn from_paths(mut installers: Vec<PathBuf>) -> Self {
        installers.sort();
        Self {
            installers,
            unreadable: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.installers.len()
    }

    /// Directories skipped during [`MediaIndex::scan`].
    pub fn unreadable(&self) -> &[PathBuf] {
        &self.unreadable
    }

    pub fn is_empty(&self) -> bool {
        self.installers.is_empty()
    }

    /// First installer whose file name carries `KB<kb>` and the
    /// architecture token, e.g. `SQLServer2019-KB5000642-x64.exe`.
    pub fn find(&self, kb: u32, architecture: Architecture) -> Option<&Path> {
        self.installers
            .iter()
            .find(|path| matches_installer(path, kb, architecture))
            .map(PathBuf::as_path)
    }
}

fn is_installer(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

pub(crate) fn matches_installer(path: &Path, kb: u32, architecture: Architecture) -> bool {
    let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    contains_kb_token(&name, kb) && name.contains(architecture.media_token())
}

/// `kb45357` must not match `kb4535706`.
fn contains_kb_token(name: &str, kb: u32) -> bool {
    let token = format!("kb{kb}");
    name.match_indices(&token).any(|(start, _)| {
        !name[start + token.len()..]
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_digit())
    })
}

/// Attaches local media to every planned action.
///
/// Missing media becomes [`InstallerPath::PendingDownload`] plus one queued
/// request per `(KB, architecture)` when downloading is allowed; otherwise
/// the host fails planning.
pub fn resolve_installers(
    hosts: &mut [PlannedHost],
    index: &MediaIndex,
    allow_download: bool,
) -> DownloadQueue {
    let mut queue = DownloadQueue::default();

    for host in hosts.iter_mut() {
        let mut missing: Option<String> = None;
        let mut requests = Vec::new();
        if let Ok(plan) = &mut host.plan {
            for action in &mut plan.actions {
                match index.find(action.kb, action.architecture) {
                    Some(path) => action.installer = InstallerPath::Local(path.to_path_buf()),
                    None if allow_download => {
                        action.installer = InstallerPath::PendingDownload;
                        requests.push(DownloadRequest {
                            kb: action.kb,
                            architecture: action.architecture,
                        });
                    }
                    None => {
                        missing = Some(format!(
                            "no installer media for {} ({}) in the media repositories and downloading is disabled",
                            action.kb_label(),
                            action.architecture
                        ));
                        break;
                    }
                }
            }
        }

        match missing {
            Some(message) => {
                warn!(host = %host.computer_name, "{message}");
                host.fail(PatchError::Planning(message));
            }
            None => {
                for request in requests {
                    queue.insert(request);
                }
            }
        }
    }

    queue
}
