use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PatchError;
use crate::version::{cumulative_update_rank, service_pack_rank, BuildVersion, FamilyKey};

const BASE_SERVICE_PACK: &str = "RTM";

/// One row of the build reference.
///
/// `SP`, `CU` and `Name` are only present on the record that introduces
/// them; walking a family with [`walk_family`] yields the accumulated values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecord {
    #[serde(rename = "Version")]
    pub version: BuildVersion,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(rename = "SP", default, skip_serializing_if = "Option::is_none")]
    pub service_pack: Option<String>,
    #[serde(rename = "CU", default, skip_serializing_if = "Option::is_none")]
    pub cumulative_update: Option<String>,
    #[serde(
        rename = "KBList",
        default,
        deserialize_with = "deserialize_kb_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub kb_list: Vec<u32>,
    #[serde(
        rename = "SupportedUntil",
        default,
        deserialize_with = "deserialize_support_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub supported_until: Option<NaiveDate>,
    #[serde(rename = "Retired", default, skip_serializing_if = "is_false")]
    pub retired: bool,
}

/// On-disk shape of the reference cache and of the remote reference source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceDocument {
    #[serde(rename = "LastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "Data")]
    pub data: Vec<BuildRecord>,
}

/// A record seen during a family walk, with the SP/CU context accumulated up
/// to and including it.
#[derive(Debug, Clone, Copy)]
pub struct WalkStep<'a> {
    pub record: &'a BuildRecord,
    pub position: usize,
    pub service_pack: &'a str,
    pub cumulative_update: Option<&'a str>,
    pub release_name: Option<&'a str>,
}

/// Validated, version-ordered build reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildTable {
    records: Vec<BuildRecord>,
}

impl BuildRecord {
    pub fn new(version: BuildVersion) -> Self {
        Self {
            version,
            release_name: None,
            service_pack: None,
            cumulative_update: None,
            kb_list: Vec::new(),
            supported_until: None,
            retired: false,
        }
    }

    pub fn contains_kb(&self, kb: u32) -> bool {
        self.kb_list.contains(&kb)
    }
}

impl BuildTable {
    pub fn new(mut records: Vec<BuildRecord>) -> Result<Self, PatchError> {
        records.sort_by(|left, right| left.version.cmp(&right.version));

        for pair in records.windows(2) {
            if pair[0].version.cmp_reference(&pair[1].version) == Ordering::Equal {
                return Err(PatchError::Load(format!(
                    "duplicate build {} in reference data",
                    pair[1].version
                )));
            }
        }

        let table = Self { records };
        for family in table.families() {
            validate_family(table.family_records(family))?;
        }
        Ok(table)
    }

    pub fn records(&self) -> &[BuildRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn families(&self) -> Vec<FamilyKey> {
        let mut families = self
            .records
            .iter()
            .map(|record| record.version.family())
            .collect::<Vec<_>>();
        families.dedup();
        families
    }

    /// Records of one family. Records are sorted by version, so a family is a
    /// contiguous run.
    pub fn family_records(&self, family: FamilyKey) -> &[BuildRecord] {
        let start = self
            .records
            .partition_point(|record| record.version.family() < family);
        let end = self
            .records
            .partition_point(|record| record.version.family() <= family);
        &self.records[start..end]
    }

    pub fn family_for_release(&self, release_name: &str) -> Option<FamilyKey> {
        let needle = release_name.trim();
        self.records
            .iter()
            .find(|record| {
                record
                    .release_name
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(needle))
            })
            .map(|record| record.version.family())
    }

    pub fn release_name(&self, family: FamilyKey) -> Option<&str> {
        self.family_records(family)
            .iter()
            .find_map(|record| record.release_name.as_deref())
    }
}

/// Walks one family's records in ascending order, accumulating SP/CU labels.
/// A new SP resets the CU context; a family without an SP on its first record
/// starts at `RTM`.
pub fn walk_family(records: &[BuildRecord]) -> Vec<WalkStep<'_>> {
    let mut steps = Vec::with_capacity(records.len());
    let mut service_pack = BASE_SERVICE_PACK;
    let mut cumulative_update: Option<&str> = None;
    let mut release_name: Option<&str> = None;

    for (position, record) in records.iter().enumerate() {
        if let Some(name) = record.release_name.as_deref() {
            release_name = Some(name);
        }
        if let Some(sp) = record.service_pack.as_deref() {
            service_pack = sp;
            cumulative_update = None;
        }
        if let Some(cu) = record.cumulative_update.as_deref() {
            cumulative_update = Some(cu);
        }
        steps.push(WalkStep {
            record,
            position,
            service_pack,
            cumulative_update,
            release_name,
        });
    }

    steps
}

fn validate_family(records: &[BuildRecord]) -> Result<(), PatchError> {
    let mut previous: Option<(u32, u32)> = None;
    for step in walk_family(records) {
        let sp_rank = service_pack_rank(step.service_pack).ok_or_else(|| {
            PatchError::Load(format!(
                "build {} has unrecognized service pack label '{}'",
                step.record.version, step.service_pack
            ))
        })?;
        let cu_rank = match step.cumulative_update {
            Some(label) => cumulative_update_rank(label).ok_or_else(|| {
                PatchError::Load(format!(
                    "build {} has unrecognized cumulative update label '{label}'",
                    step.record.version
                ))
            })?,
            None => 0,
        };

        if let Some((previous_sp, previous_cu)) = previous {
            let regressed = sp_rank < previous_sp || (sp_rank == previous_sp && cu_rank < previous_cu);
            if regressed {
                return Err(PatchError::Load(format!(
                    "build {} goes back to {}{} after a later patch level",
                    step.record.version,
                    step.service_pack,
                    step.cumulative_update.unwrap_or_default()
                )));
            }
        }
        previous = Some((sp_rank, cu_rank));
    }
    Ok(())
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KbItem {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KbField {
    One(KbItem),
    Many(Vec<KbItem>),
}

/// Parses `4535706`, `"4535706"` and `"KB4535706"`.
pub fn parse_kb(input: &str) -> Option<u32> {
    let trimmed = input.trim();
    let digits = match trimmed.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("kb") => &trimmed[2..],
        _ => trimmed,
    };
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn kb_item_value(item: KbItem) -> Result<Option<u32>, String> {
    match item {
        KbItem::Number(value) => u32::try_from(value)
            .map(Some)
            .map_err(|_| format!("KB number {value} is out of range")),
        KbItem::Text(text) if text.trim().is_empty() => Ok(None),
        KbItem::Text(text) => parse_kb(&text)
            .map(Some)
            .ok_or_else(|| format!("invalid KB identifier '{text}'")),
    }
}

fn deserialize_kb_list<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let field = Option::<KbField>::deserialize(deserializer)?;
    let items = match field {
        None => Vec::new(),
        Some(KbField::One(item)) => vec![item],
        Some(KbField::Many(items)) => items,
    };

    let mut kbs = Vec::with_capacity(items.len());
    for item in items {
        if let Some(kb) = kb_item_value(item).map_err(serde::de::Error::custom)? {
            kbs.push(kb);
        }
    }
    Ok(kbs)
}

fn deserialize_support_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map(Some)
        .map_err(|err| serde::de::Error::custom(format!("invalid SupportedUntil '{raw}': {err}")))
}
