use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use patchfleet_core::{Architecture, InstallerPath, PatchError, PlannedHost};
use tracing::{info, warn};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadRequest {
    pub kb: u32,
    pub architecture: Architecture,
}

impl DownloadRequest {
    /// Local file name for the downloaded installer; the media index
    /// recognizes it on later runs.
    pub fn file_name(&self) -> String {
        format!("patchfleet-KB{}-{}.exe", self.kb, self.architecture)
    }
}

/// Installers to fetch, one entry per `(KB, architecture)` however many
/// hosts need it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadQueue {
    requests: BTreeSet<DownloadRequest>,
}

impl DownloadQueue {
    pub fn insert(&mut self, request: DownloadRequest) -> bool {
        self.requests.insert(request)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DownloadRequest> {
        self.requests.iter()
    }
}

/// Fetches installer media for one KB.
pub trait UpdateDownloader {
    fn download(
        &self,
        kb: u32,
        architecture: Architecture,
        destination_dir: &Path,
    ) -> Result<PathBuf, PatchError>;
}

/// Downloads installers from a URL template with `{kb}` and `{arch}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    url_template: String,
}

impl HttpDownloader {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, kb: u32, architecture: Architecture) -> String {
        self.url_template
            .replace("{kb}", &kb.to_string())
            .replace("{arch}", architecture.as_str())
    }
}

impl UpdateDownloader for HttpDownloader {
    fn download(
        &self,
        kb: u32,
        architecture: Architecture,
        destination_dir: &Path,
    ) -> Result<PathBuf, PatchError> {
        let request = DownloadRequest { kb, architecture };
        let destination = destination_dir.join(request.file_name());
        if destination.exists() {
            return Ok(destination);
        }

        fs::create_dir_all(destination_dir).map_err(|err| {
            PatchError::Download(format!(
                "failed to create download dir {}: {err}",
                destination_dir.display()
            ))
        })?;

        let url = self.url_for(kb, architecture);
        let part_path = destination.with_file_name(format!("{}.part", request.file_name()));
        if let Err(err) = fetch_to(&url, &part_path) {
            let _ = fs::remove_file(&part_path);
            return Err(err);
        }

        fs::rename(&part_path, &destination).map_err(|err| {
            let _ = fs::remove_file(&part_path);
            PatchError::Download(format!(
                "failed to move downloaded installer into place {}: {err}",
                destination.display()
            ))
        })?;

        Ok(destination)
    }
}

fn fetch_to(url: &str, out_path: &Path) -> Result<(), PatchError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|err| PatchError::Download(format!("failed building HTTP client: {err}")))?;
    let mut response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|err| PatchError::Download(format!("GET {url}: {err}")))?;

    let mut file = fs::File::create(out_path).map_err(|err| {
        PatchError::Download(format!("failed to create {}: {err}", out_path.display()))
    })?;
    response
        .copy_to(&mut file)
        .map_err(|err| PatchError::Download(format!("reading body of {url}: {err}")))?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub downloaded: BTreeMap<DownloadRequest, PathBuf>,
    pub failed: BTreeMap<DownloadRequest, PatchError>,
}

/// Fetches each queued installer once, then points every pending action at
/// the local file. Hosts needing a download that failed are failed; other
/// hosts are untouched.
pub fn apply_downloads(
    hosts: &mut [PlannedHost],
    queue: &DownloadQueue,
    downloader: &dyn UpdateDownloader,
    destination_dir: &Path,
) -> DownloadSummary {
    let mut summary = DownloadSummary::default();
    for request in queue.iter() {
        match downloader.download(request.kb, request.architecture, destination_dir) {
            Ok(path) => {
                info!(kb = request.kb, arch = %request.architecture, path = %path.display(), "downloaded installer");
                summary.downloaded.insert(*request, path);
            }
            Err(err) => {
                warn!(kb = request.kb, arch = %request.architecture, error = %err, "installer download failed");
                summary.failed.insert(*request, err);
            }
        }
    }

    for host in hosts.iter_mut() {
        let mut failure: Option<PatchError> = None;
        if let Ok(plan) = &mut host.plan {
            for action in &mut plan.actions {
                if action.installer != InstallerPath::PendingDownload {
                    continue;
                }
                let request = DownloadRequest {
                    kb: action.kb,
                    architecture: action.architecture,
                };
                match summary.downloaded.get(&request) {
                    Some(path) => action.installer = InstallerPath::Local(path.clone()),
                    None => {
                        failure = Some(summary.failed.get(&request).cloned().unwrap_or_else(|| {
                            PatchError::Download(format!(
                                "{} ({}) was never queued for download",
                                action.kb_label(),
                                action.architecture
                            ))
                        }));
                        break;
                    }
                }
            }
        }
        if let Some(err) = failure {
            host.fail(err);
        }
    }

    summary
}

/// Fails every host still waiting on a download, e.g. when no download
/// source is configured. Hosts whose media is local keep their plans.
pub fn fail_pending_downloads(hosts: &mut [PlannedHost], error: &PatchError) -> usize {
    let mut failed = 0;
    for host in hosts.iter_mut() {
        let pending = host
            .actions()
            .iter()
            .any(|action| action.installer == InstallerPath::PendingDownload);
        if pending {
            warn!(host = %host.computer_name, error = %error, "host cannot get its installer media");
            host.fail(error.clone());
            failed += 1;
        }
    }
    failed
}
