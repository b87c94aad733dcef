use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arch::Architecture;
use crate::error::{ErrorKind, PatchError};
use crate::version::{BuildVersion, FamilyKey};

/// One installed database-engine instance, as reported by host inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Component {
    pub computer_name: String,
    pub instance_name: String,
    pub major_version: u32,
    pub architecture: Architecture,
    pub current_version: BuildVersion,
}

impl Component {
    pub fn family(&self) -> FamilyKey {
        self.current_version.family()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerPath {
    Unresolved,
    Local(PathBuf),
    PendingDownload,
}

impl InstallerPath {
    pub fn local(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            Self::Unresolved | Self::PendingDownload => None,
        }
    }
}

/// A single planned installation step on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAction {
    pub major_version: u32,
    pub family: FamilyKey,
    pub architecture: Architecture,
    pub kb: u32,
    pub target_version: BuildVersion,
    pub service_pack: String,
    pub cumulative_update: Option<String>,
    pub instances: Vec<String>,
    pub installer: InstallerPath,
    pub restart_required: bool,
    pub successful: bool,
    pub restarted: bool,
    pub notes: Vec<String>,
}

impl UpdateAction {
    /// `SP1CU5`, `SP2`, `RTM` ...
    pub fn level_label(&self) -> String {
        match &self.cumulative_update {
            Some(cu) => format!("{}{}", self.service_pack, cu),
            None => self.service_pack.clone(),
        }
    }

    pub fn kb_label(&self) -> String {
        format!("KB{}", self.kb)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} ({} {}, {}) -> {}",
            self.kb_label(),
            self.family,
            self.level_label(),
            self.architecture,
            self.target_version
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputerPlan {
    pub computer_name: String,
    pub actions: Vec<UpdateAction>,
    /// Resume a partially applied run: a reboot left pending by it does not
    /// block the first action.
    pub continue_run: bool,
}

impl ComputerPlan {
    pub fn new(computer_name: impl Into<String>, continue_run: bool) -> Self {
        Self {
            computer_name: computer_name.into(),
            actions: Vec::new(),
            continue_run,
        }
    }
}

/// Planning result for one host: a plan, or the error that failed the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedHost {
    pub computer_name: String,
    pub plan: Result<ComputerPlan, PatchError>,
}

impl PlannedHost {
    pub fn planned(plan: ComputerPlan) -> Self {
        Self {
            computer_name: plan.computer_name.clone(),
            plan: Ok(plan),
        }
    }

    pub fn failed(computer_name: impl Into<String>, error: PatchError) -> Self {
        Self {
            computer_name: computer_name.into(),
            plan: Err(error),
        }
    }

    pub fn actions(&self) -> &[UpdateAction] {
        match &self.plan {
            Ok(plan) => &plan.actions,
            Err(_) => &[],
        }
    }

    /// Fails the host, dropping its actions.
    pub fn fail(&mut self, error: PatchError) {
        self.plan = Err(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
    DryRun,
    UpToDate,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::DryRun => "dry-run",
            Self::UpToDate => "up-to-date",
        }
    }
}

/// Terminal record for one `(host, action)` pair, or a host-level record
/// with no action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub computer_name: String,
    pub action: Option<UpdateAction>,
    pub outcome: Outcome,
    pub error: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub notes: Vec<String>,
}

impl ExecutionResult {
    pub fn host_level(
        computer_name: impl Into<String>,
        outcome: Outcome,
        error: Option<&PatchError>,
        note: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            computer_name: computer_name.into(),
            action: None,
            outcome,
            error: error.map(PatchError::kind),
            started_at: now,
            finished_at: now,
            notes: vec![note.into()],
        }
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    pub fn successful(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded | Outcome::UpToDate | Outcome::DryRun)
    }
}

/// All results of one run, grouped per host in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    hosts: BTreeMap<String, Vec<ExecutionResult>>,
}

impl FleetReport {
    pub fn record(&mut self, result: ExecutionResult) {
        self.hosts
            .entry(result.computer_name.clone())
            .or_default()
            .push(result);
    }

    pub fn host(&self, computer_name: &str) -> &[ExecutionResult] {
        self.hosts
            .get(computer_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &[ExecutionResult])> {
        self.hosts
            .iter()
            .map(|(name, results)| (name.as_str(), results.as_slice()))
    }

    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.hosts.values().flatten()
    }

    pub fn has_failures(&self) -> bool {
        self.results().any(ExecutionResult::is_failure)
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, results)| results.iter().any(ExecutionResult::is_failure))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
