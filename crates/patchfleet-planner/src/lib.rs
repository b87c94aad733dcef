//! Turns resolved targets into per-host action lists and attaches installer
//! media to them.

mod download;
mod media;
mod plan;
mod spec;

pub use download::{
    apply_downloads, fail_pending_downloads, DownloadQueue, DownloadRequest, DownloadSummary,
    HttpDownloader, UpdateDownloader,
};
pub use media::{resolve_installers, MediaIndex};
pub use plan::{plan_host, plan_inventory};
pub use spec::{resolve_family, VersionSpec};

#[cfg(test)]
mod tests;
