use std::fmt;

use anyhow::anyhow;
use chrono::NaiveDate;
use patchfleet_core::{BuildVersion, FamilyKey, WalkStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Approximate,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Approximate => "approximate",
        }
    }
}

/// Answer to a single resolver query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBuild {
    pub match_type: MatchType,
    pub version: BuildVersion,
    pub family: FamilyKey,
    pub service_pack: String,
    pub cumulative_update: Option<String>,
    pub kb_list: Vec<u32>,
    pub supported_until: Option<NaiveDate>,
    pub retired: bool,
    pub release_name: Option<String>,
    /// Last known build of its family.
    pub is_latest: bool,
    pub warning: Option<String>,
}

impl ResolvedBuild {
    pub(crate) fn from_step(step: &WalkStep<'_>, match_type: MatchType, is_latest: bool) -> Self {
        Self {
            match_type,
            version: step.record.version,
            family: step.record.version.family(),
            service_pack: step.service_pack.to_string(),
            cumulative_update: step.cumulative_update.map(str::to_string),
            kb_list: step.record.kb_list.clone(),
            supported_until: step.record.supported_until,
            retired: step.record.retired,
            release_name: step.release_name.map(str::to_string),
            is_latest,
            warning: None,
        }
    }

    pub(crate) fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        self.warning = Some(match self.warning.take() {
            Some(existing) => format!("{existing}; {warning}"),
            None => warning,
        });
    }

    /// `SP1CU5`, `SP2`, `RTM` ...
    pub fn level_label(&self) -> String {
        match &self.cumulative_update {
            Some(cu) => format!("{}{}", self.service_pack, cu),
            None => self.service_pack.clone(),
        }
    }

    pub fn primary_kb(&self) -> Option<u32> {
        self.kb_list.first().copied()
    }
}

/// Compliance rule for an installed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    MinimumBuild(BuildVersion),
    Latest,
    /// At most `sp_behind` Service Packs and `cu_behind` Cumulative Updates
    /// behind the newest known release. A missing SP count means the newest
    /// SP; a missing CU count targets the bare SP.
    MaxBehind {
        sp_behind: Option<u32>,
        cu_behind: Option<u32>,
    },
}

impl Policy {
    /// Parses `1SP`, `2CU`, `1SP1CU` or `1SP 1CU`.
    pub fn parse_max_behind(input: &str) -> anyhow::Result<Self> {
        let normalized = input
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(anyhow!("max-behind must name at least one of SP or CU"));
        }

        let mut sp_behind = None;
        let mut cu_behind = None;
        let mut rest = normalized.as_str();
        while !rest.is_empty() {
            let digits_len = rest.chars().take_while(char::is_ascii_digit).count();
            if digits_len == 0 {
                return Err(anyhow!("invalid max-behind '{input}': expected e.g. 1SP1CU"));
            }
            let count = rest[..digits_len]
                .parse::<u32>()
                .map_err(|_| anyhow!("invalid max-behind count in '{input}'"))?;
            rest = &rest[digits_len..];

            let slot = if let Some(after) = rest.strip_prefix("SP") {
                rest = after;
                &mut sp_behind
            } else if let Some(after) = rest.strip_prefix("CU") {
                rest = after;
                &mut cu_behind
            } else {
                return Err(anyhow!("invalid max-behind '{input}': expected SP or CU after {count}"));
            };
            if slot.replace(count).is_some() {
                return Err(anyhow!("invalid max-behind '{input}': repeated unit"));
            }
        }

        Ok(Self::MaxBehind {
            sp_behind,
            cu_behind,
        })
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinimumBuild(version) => write!(f, "minimum build {version}"),
            Self::Latest => f.write_str("latest"),
            Self::MaxBehind {
                sp_behind,
                cu_behind,
            } => {
                f.write_str("max behind")?;
                if let Some(sp) = sp_behind {
                    write!(f, " {sp}SP")?;
                }
                if let Some(cu) = cu_behind {
                    write!(f, " {cu}CU")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceTarget {
    pub family: FamilyKey,
    pub version: BuildVersion,
    pub service_pack: Option<String>,
    pub cumulative_update: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceReport {
    pub installed_version: BuildVersion,
    /// Reference entry for the installed build; `None` when the reference
    /// cannot place it, which a minimum-build policy does not need.
    pub installed: Option<ResolvedBuild>,
    pub warnings: Vec<String>,
    pub target: ComplianceTarget,
    pub compliant: bool,
}
