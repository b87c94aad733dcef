use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Numeric product build, `major.minor.build[.revision]`.
///
/// Reference records frequently omit the revision. Use
/// [`BuildVersion::cmp_reference`] when comparing an installed build with a
/// reference record so a missing revision on either side is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: Option<u32>,
}

/// A release family: every build sharing `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FamilyKey {
    pub major: u32,
    pub minor: u32,
}

impl BuildVersion {
    pub fn new(major: u32, minor: u32, build: u32, revision: Option<u32>) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        let parts = trimmed.split('.').collect::<Vec<_>>();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(anyhow!(
                "invalid build version '{trimmed}': expected major.minor.build[.revision]"
            ));
        }

        let mut numbers = Vec::with_capacity(parts.len());
        for part in &parts {
            if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
                return Err(anyhow!(
                    "invalid build version '{trimmed}': '{part}' is not a number"
                ));
            }
            let value = part
                .parse::<u32>()
                .with_context(|| format!("invalid build version component '{part}'"))?;
            numbers.push(value);
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            build: numbers[2],
            revision: numbers.get(3).copied(),
        })
    }

    pub fn family(&self) -> FamilyKey {
        FamilyKey {
            major: self.major,
            minor: self.minor,
        }
    }

    /// Compares against a reference build, ignoring the revision unless both
    /// sides carry one.
    pub fn cmp_reference(&self, reference: &BuildVersion) -> Ordering {
        let base = (self.major, self.minor, self.build).cmp(&(
            reference.major,
            reference.minor,
            reference.build,
        ));
        if base != Ordering::Equal {
            return base;
        }
        match (self.revision, reference.revision) {
            (Some(left), Some(right)) => left.cmp(&right),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)?;
        if let Some(revision) = self.revision {
            write!(f, ".{revision}")?;
        }
        Ok(())
    }
}

impl FromStr for BuildVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for BuildVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BuildVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl FamilyKey {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        let Some((major, minor)) = trimmed.split_once('.') else {
            return Err(anyhow!("invalid release family '{trimmed}': expected major.minor"));
        };
        let major = major
            .parse::<u32>()
            .with_context(|| format!("invalid release family '{trimmed}'"))?;
        let minor = minor
            .parse::<u32>()
            .with_context(|| format!("invalid release family '{trimmed}'"))?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for FamilyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Rank of a Service Pack label: `RTM` is 0, `SPn` is n.
pub fn service_pack_rank(label: &str) -> Option<u32> {
    let upper = label.trim().to_ascii_uppercase();
    if upper == "RTM" {
        return Some(0);
    }
    numbered_label_rank(&upper, "SP")
}

/// Rank of a Cumulative Update label: `CUn` is n.
pub fn cumulative_update_rank(label: &str) -> Option<u32> {
    numbered_label_rank(&label.trim().to_ascii_uppercase(), "CU")
}

/// Normalizes `sp1`/`Sp1` to `SP1`, `rtm` to `RTM`, `cu7` to `CU7`.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_ascii_uppercase()
}

fn numbered_label_rank(upper: &str, prefix: &str) -> Option<u32> {
    let digits = upper.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
