use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use patchfleet_executor::{
    AuthProtocol, CommandTemplates, Credential, ExecutionOptions, DEFAULT_REMOTE_MEDIA_DIR,
    DEFAULT_RESTART_TIMEOUT, DEFAULT_THROTTLE,
};
use patchfleet_registry::{BuildReferenceStore, BundledReference, HttpReferenceSource};
use patchfleet_security::TrustedKey;
use serde::Deserialize;

pub const DEFAULT_REFERENCE_URL: &str = "https://dataplat.github.io/assets/dbatools-buildref-index.json";
pub const PASSWORD_ENV: &str = "PATCHFLEET_PASSWORD";

/// `config.toml`; every key is optional and CLI flags win over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub reference: ReferenceConfig,
    pub media: MediaConfig,
    pub execution: ExecutionConfig,
    pub credential: CredentialConfig,
    pub backend: CommandTemplates,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReferenceConfig {
    pub cache_path: Option<PathBuf>,
    pub url: Option<String>,
    pub signature_url: Option<String>,
    /// Hex Ed25519 public key; refreshed documents must be signed with it.
    pub trusted_key: Option<String>,
    pub bundled_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediaConfig {
    pub repositories: Vec<PathBuf>,
    /// `{kb}` and `{arch}` are substituted.
    pub download_url_template: Option<String>,
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub throttle: Option<usize>,
    pub restart_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub protocol: Option<String>,
    pub fallback_protocol: Option<String>,
    pub remote_media_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialConfig {
    pub username: Option<String>,
}

impl Config {
    /// An explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path()?, false),
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("invalid configuration file: {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
                Ok(Self::default())
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed reading configuration file: {}", path.display())),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed parsing configuration TOML")
    }

    pub fn reference_store(&self) -> Result<BuildReferenceStore> {
        let cache_path = match &self.reference.cache_path {
            Some(path) => path.clone(),
            None => BuildReferenceStore::default_cache_path()?,
        };
        let bundled = match &self.reference.bundled_path {
            Some(path) => BundledReference::Path(path.clone()),
            None => BundledReference::Embedded,
        };

        let mut store = BuildReferenceStore::new(cache_path).with_bundled(bundled);
        if let Some(key) = &self.reference.trusted_key {
            let key = TrustedKey::from_hex(key).context("invalid [reference] trusted_key")?;
            store = store.with_trusted_key(key);
        }
        Ok(store)
    }

    /// A trusted key without an explicit signature URL expects `<url>.sig`.
    pub fn reference_source(&self, url_override: Option<&str>) -> HttpReferenceSource {
        let url = url_override
            .or(self.reference.url.as_deref())
            .unwrap_or(DEFAULT_REFERENCE_URL)
            .to_string();
        let signature_url = match (&self.reference.signature_url, &self.reference.trusted_key) {
            (Some(signature_url), _) => Some(signature_url.clone()),
            (None, Some(_)) => Some(format!("{url}.sig")),
            (None, None) => None,
        };

        let source = HttpReferenceSource::new(url);
        match signature_url {
            Some(signature_url) => source.with_signature_url(signature_url),
            None => source,
        }
    }

    pub fn credential(&self, username_override: Option<&str>) -> Credential {
        let username = username_override.or(self.credential.username.as_deref());
        let password = std::env::var(PASSWORD_ENV)
            .ok()
            .filter(|value| !value.is_empty());
        match username {
            Some(username) => Credential::new(username, password),
            None => Credential::current_user(),
        }
    }

    pub fn protocols(
        &self,
        primary_override: Option<AuthProtocol>,
        fallback_override: Option<AuthProtocol>,
    ) -> Result<(AuthProtocol, Option<AuthProtocol>)> {
        let primary = match primary_override {
            Some(protocol) => protocol,
            None => parse_protocol(self.execution.protocol.as_deref(), "protocol")?
                .unwrap_or(AuthProtocol::Default),
        };
        let fallback = match fallback_override {
            Some(protocol) => Some(protocol),
            None => parse_protocol(self.execution.fallback_protocol.as_deref(), "fallback_protocol")?,
        };
        Ok((primary, fallback))
    }

    pub fn execution_options(
        &self,
        throttle_override: Option<usize>,
        restart: bool,
        dry_run: bool,
    ) -> ExecutionOptions {
        ExecutionOptions {
            throttle: throttle_override
                .or(self.execution.throttle)
                .unwrap_or(DEFAULT_THROTTLE),
            restart,
            dry_run,
            restart_timeout: self
                .execution
                .restart_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESTART_TIMEOUT),
            remote_media_dir: self
                .execution
                .remote_media_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_REMOTE_MEDIA_DIR.to_string()),
        }
    }

    /// CLI repositories replace the configured ones.
    pub fn repositories(&self, cli_repositories: &[PathBuf]) -> Vec<PathBuf> {
        if cli_repositories.is_empty() {
            self.media.repositories.clone()
        } else {
            cli_repositories.to_vec()
        }
    }

    pub fn download_dir(&self, repositories: &[PathBuf]) -> Option<PathBuf> {
        self.media
            .download_dir
            .clone()
            .or_else(|| repositories.first().cloned())
    }
}

fn parse_protocol(value: Option<&str>, key: &str) -> Result<Option<AuthProtocol>> {
    value
        .map(|value| {
            AuthProtocol::parse(value)
                .ok_or_else(|| anyhow!("invalid [execution] {key} '{value}'"))
        })
        .transpose()
}

pub fn default_config_path() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("APPDATA")
            .context("APPDATA is not set; cannot resolve the configuration path")?;
        return Ok(PathBuf::from(app_data).join("patchfleet").join("config.toml"));
    }

    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        if !config_home.trim().is_empty() {
            return Ok(PathBuf::from(config_home)
                .join("patchfleet")
                .join("config.toml"));
        }
    }
    let home =
        std::env::var("HOME").context("HOME is not set; cannot resolve the configuration path")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("patchfleet")
        .join("config.toml"))
}
