use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use patchfleet_core::{
    cumulative_update_rank, parse_kb, service_pack_rank, BuildTable, BuildVersion, FamilyKey,
    PatchError,
};
use patchfleet_resolver::Policy;

/// Desired patch state requested for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// A fully qualified build, e.g. `15.0.4033.1`.
    Build(BuildVersion),
    /// The build shipped by a KB, e.g. `KB4548597`.
    Kb(u32),
    /// A patch level, e.g. `2019SP1CU5`, `SP2`, `CU5`. A missing SP means the
    /// component's current SP; a missing CU means the bare SP.
    Level {
        family: Option<String>,
        service_pack: Option<String>,
        cumulative_update: Option<String>,
    },
    /// Newest known build, e.g. `Latest` or `2019Latest`.
    Latest { family: Option<String> },
    /// Whatever build a compliance policy demands, computed per family.
    Policy(Policy),
}

impl VersionSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let compact = input
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if compact.is_empty() {
            return Err(anyhow!("version specification must not be empty"));
        }

        let all_digits = compact.chars().all(|ch| ch.is_ascii_digit());
        if all_digits && compact.len() <= 4 {
            return Err(anyhow!(
                "'{input}' names a release, not a patch level; use e.g. {compact}Latest or {compact}SP1"
            ));
        }
        if compact.starts_with("KB") || all_digits {
            return parse_kb(&compact)
                .map(Self::Kb)
                .ok_or_else(|| anyhow!("invalid KB specification '{input}'"));
        }

        if compact.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
            && compact.matches('.').count() >= 2
        {
            return BuildVersion::parse(&compact).map(Self::Build);
        }

        let family_len = level_start(&compact);
        let family = (family_len > 0).then(|| compact[..family_len].to_string());
        if let Some(family) = &family {
            let valid = family.starts_with(|ch: char| ch.is_ascii_digit())
                && family.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '.');
            if !valid {
                return Err(anyhow!(
                    "invalid release '{family}' in '{input}': expected e.g. 2019, 2008R2 or 15.0"
                ));
            }
        }
        let rest = &compact[family_len..];

        if rest == "LATEST" {
            return Ok(Self::Latest { family });
        }

        let (service_pack, rest) = split_label(rest, &["RTM", "SP"]);
        let (cumulative_update, rest) = split_label(rest, &["CU"]);
        if !rest.is_empty() || (service_pack.is_none() && cumulative_update.is_none()) {
            return Err(anyhow!(
                "invalid version specification '{input}': expected a build, a KB, Latest or a level like 2019SP1CU5"
            ));
        }
        if let Some(label) = &service_pack {
            service_pack_rank(label)
                .ok_or_else(|| anyhow!("invalid service pack '{label}' in '{input}'"))?;
        }
        if let Some(label) = &cumulative_update {
            cumulative_update_rank(label)
                .ok_or_else(|| anyhow!("invalid cumulative update '{label}' in '{input}'"))?;
        }

        Ok(Self::Level {
            family,
            service_pack,
            cumulative_update,
        })
    }

    pub fn family_filter(&self) -> Option<&str> {
        match self {
            Self::Level { family, .. } | Self::Latest { family } => family.as_deref(),
            Self::Build(_) | Self::Kb(_) | Self::Policy(_) => None,
        }
    }
}

/// Offset of the first `LATEST`, `RTM`, `SPn` or `CUn` token; everything
/// before it names the release (`2019`, `2008R2`, `15.0`).
fn level_start(compact: &str) -> usize {
    compact
        .char_indices()
        .map(|(offset, _)| offset)
        .find(|&offset| {
            let rest = &compact[offset..];
            rest == "LATEST"
                || rest.starts_with("RTM")
                || ["SP", "CU"].iter().any(|prefix| {
                    rest.strip_prefix(prefix)
                        .is_some_and(|after| after.starts_with(|ch: char| ch.is_ascii_digit()))
                })
        })
        .unwrap_or(compact.len())
}

/// Splits a leading `RTM`, `SPn` or `CUn` label off `input`.
fn split_label<'a>(input: &'a str, prefixes: &[&str]) -> (Option<String>, &'a str) {
    for prefix in prefixes {
        let Some(after) = input.strip_prefix(prefix) else {
            continue;
        };
        if *prefix == "RTM" {
            return (Some("RTM".to_string()), after);
        }
        let digits = after.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return (None, input);
        }
        let label_len = prefix.len() + digits;
        return (Some(input[..label_len].to_string()), &input[label_len..]);
    }
    (None, input)
}

/// Resolves a family token: `15.0` directly, or a release name like `2019`.
pub fn resolve_family(table: &BuildTable, token: &str) -> Result<FamilyKey, PatchError> {
    if token.contains('.') {
        return FamilyKey::parse(token)
            .map_err(|err| PatchError::Planning(format!("invalid release family '{token}': {err}")));
    }
    table.family_for_release(token).ok_or_else(|| {
        PatchError::Planning(format!(
            "release '{token}' is not named by any record in the build reference"
        ))
    })
}

impl FromStr for VersionSpec {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build(version) => write!(f, "{version}"),
            Self::Kb(kb) => write!(f, "KB{kb}"),
            Self::Level {
                family,
                service_pack,
                cumulative_update,
            } => write!(
                f,
                "{}{}{}",
                family.as_deref().unwrap_or_default(),
                service_pack.as_deref().unwrap_or_default(),
                cumulative_update.as_deref().unwrap_or_default()
            ),
            Self::Latest { family } => {
                write!(f, "{}Latest", family.as_deref().unwrap_or_default())
            }
            Self::Policy(policy) => write!(f, "{policy}"),
        }
    }
}
