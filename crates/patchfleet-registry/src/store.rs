use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use patchfleet_core::{BuildTable, PatchError, ReferenceDocument};
use patchfleet_security::{sha256_hex, TrustedKey};

use crate::fs_ops::{read_optional, write_file_atomically};
use crate::source::ReferenceSource;

/// Age after which a loaded reference is reported as stale.
pub const STALE_AFTER_DAYS: i64 = 45;

const BUNDLED_REFERENCE: &str = include_str!("../data/buildref-bundled.json");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundledReference {
    /// The table compiled into the binary.
    Embedded,
    Path(PathBuf),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceOrigin {
    Cache,
    Bundled,
    Remote,
}

impl ReferenceOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Bundled => "bundled",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedReference {
    pub table: BuildTable,
    pub last_updated: DateTime<Utc>,
    pub origin: ReferenceOrigin,
    /// SHA-256 of the canonical JSON of the records, independent of
    /// formatting and `LastUpdated`.
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    Updated,
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub reference: LoadedReference,
}

impl LoadedReference {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_updated
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > Duration::days(STALE_AFTER_DAYS)
    }

    pub fn staleness_warning(&self, now: DateTime<Utc>) -> Option<String> {
        if !self.is_stale(now) {
            return None;
        }
        Some(format!(
            "build reference was last updated {} ({} days ago); results may miss recent releases, run `patchfleet update-reference`",
            self.last_updated.format("%Y-%m-%d"),
            self.age(now).num_days()
        ))
    }
}

/// Owns the load/refresh lifecycle of the build reference cache file.
#[derive(Debug, Clone)]
pub struct BuildReferenceStore {
    cache_path: PathBuf,
    bundled: BundledReference,
    trusted_key: Option<TrustedKey>,
}

impl BuildReferenceStore {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            bundled: BundledReference::Embedded,
            trusted_key: None,
        }
    }

    pub fn with_bundled(mut self, bundled: BundledReference) -> Self {
        self.bundled = bundled;
        self
    }

    /// Requires refreshed documents to carry a valid detached signature.
    pub fn with_trusted_key(mut self, key: TrustedKey) -> Self {
        self.trusted_key = Some(key);
        self
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Per-user data path of the cache file.
    pub fn default_cache_path() -> anyhow::Result<PathBuf> {
        if cfg!(windows) {
            let app_data = std::env::var("LOCALAPPDATA")
                .context("LOCALAPPDATA is not set; cannot resolve the reference cache path")?;
            return Ok(PathBuf::from(app_data)
                .join("patchfleet")
                .join("buildref-cache.json"));
        }

        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            if !data_home.trim().is_empty() {
                return Ok(PathBuf::from(data_home)
                    .join("patchfleet")
                    .join("buildref-cache.json"));
            }
        }
        let home = std::env::var("HOME").context("HOME is not set; cannot resolve the reference cache path")?;
        Ok(PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("patchfleet")
            .join("buildref-cache.json"))
    }

    /// Loads the cache file, falling back to the bundled reference.
    pub fn load(&self) -> Result<LoadedReference, PatchError> {
        let cached = read_optional(&self.cache_path)
            .map_err(|err| PatchError::Load(format!("{err:#}")))?;
        if let Some(content) = cached {
            match parse_reference(&content, ReferenceOrigin::Cache) {
                Ok(reference) => {
                    tracing::debug!(
                        path = %self.cache_path.display(),
                        records = reference.table.len(),
                        "loaded build reference cache"
                    );
                    return Ok(reference);
                }
                Err(err) if self.bundled != BundledReference::None => {
                    tracing::warn!(
                        path = %self.cache_path.display(),
                        error = %err,
                        "build reference cache is unreadable, using bundled reference"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        match &self.bundled {
            BundledReference::Embedded => {
                parse_reference(BUNDLED_REFERENCE.as_bytes(), ReferenceOrigin::Bundled)
            }
            BundledReference::Path(path) => {
                let content = read_optional(path)
                    .map_err(|err| PatchError::Load(format!("{err:#}")))?
                    .ok_or_else(|| {
                        PatchError::Load(format!(
                            "no cache at {} and bundled reference {} does not exist",
                            self.cache_path.display(),
                            path.display()
                        ))
                    })?;
                parse_reference(&content, ReferenceOrigin::Bundled)
            }
            BundledReference::None => Err(PatchError::Load(format!(
                "no build reference cache at {} and no bundled default",
                self.cache_path.display()
            ))),
        }
    }

    /// Fetches, validates and persists a new reference. On error the cache
    /// file is untouched and the caller keeps using its current table.
    pub fn refresh(&self, source: &dyn ReferenceSource) -> Result<RefreshOutcome, PatchError> {
        let fetched = source.fetch()?;

        if let Some(key) = &self.trusted_key {
            let signature = fetched.signature_hex.as_deref().ok_or_else(|| {
                PatchError::Network(format!(
                    "{} did not publish a signature for key {}",
                    source.describe(),
                    key.identifier()
                ))
            })?;
            let valid = key
                .verify_detached(&fetched.payload, signature)
                .map_err(|err| PatchError::Network(format!("{err:#}")))?;
            if !valid {
                return Err(PatchError::Network(format!(
                    "signature of {} does not match key {}",
                    source.describe(),
                    key.identifier()
                )));
            }
        }

        let reference = parse_reference(&fetched.payload, ReferenceOrigin::Remote).map_err(|err| {
            PatchError::Network(format!("{} returned invalid data: {err}", source.describe()))
        })?;

        let previous_digest = read_optional(&self.cache_path)
            .ok()
            .flatten()
            .and_then(|content| parse_reference(&content, ReferenceOrigin::Cache).ok())
            .map(|previous| previous.digest);
        let status = if previous_digest.as_deref() == Some(reference.digest.as_str()) {
            RefreshStatus::UpToDate
        } else {
            RefreshStatus::Updated
        };

        write_file_atomically(&self.cache_path, &fetched.payload)
            .map_err(|err| PatchError::Network(format!("{err:#}")))?;

        tracing::info!(
            source = %source.describe(),
            records = reference.table.len(),
            up_to_date = status == RefreshStatus::UpToDate,
            "build reference refreshed"
        );

        Ok(RefreshOutcome { status, reference })
    }
}

/// Parses and validates a reference document.
pub fn parse_reference(content: &[u8], origin: ReferenceOrigin) -> Result<LoadedReference, PatchError> {
    let document: ReferenceDocument = serde_json::from_slice(content)
        .map_err(|err| PatchError::Load(format!("invalid build reference document: {err}")))?;
    let canonical = serde_json::to_vec(&document.data)
        .map_err(|err| PatchError::Load(format!("failed serializing build reference: {err}")))?;
    let digest = sha256_hex(&canonical);
    let table = BuildTable::new(document.data)?;
    if table.is_empty() {
        return Err(PatchError::Load("build reference contains no builds".to_string()));
    }

    Ok(LoadedReference {
        table,
        last_updated: document.last_updated,
        origin,
        digest,
    })
}
