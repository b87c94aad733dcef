use std::cmp::Ordering;

use patchfleet_core::{
    normalize_label, walk_family, BuildTable, BuildVersion, FamilyKey, PatchError, WalkStep,
};

use crate::types::{MatchType, ResolvedBuild};

pub(crate) fn family_steps(
    table: &BuildTable,
    family: FamilyKey,
) -> Result<Vec<WalkStep<'_>>, PatchError> {
    let records = table.family_records(family);
    if records.is_empty() {
        return Err(PatchError::NotFound(format!(
            "no known builds for release family {family}"
        )));
    }
    Ok(walk_family(records))
}

pub(crate) fn finish(steps: &[WalkStep<'_>], index: usize, match_type: MatchType) -> ResolvedBuild {
    let step = &steps[index];
    let mut resolved = ResolvedBuild::from_step(step, match_type, index + 1 == steps.len());
    if step.record.retired {
        resolved.add_warning(format!(
            "build {} ({}) has been retired by the vendor",
            resolved.version,
            resolved.level_label()
        ));
    }
    resolved
}

/// Finds `build` in its family: the exact record, or the nearest lower one.
pub fn resolve_by_version(table: &BuildTable, build: &BuildVersion) -> Result<ResolvedBuild, PatchError> {
    let steps = family_steps(table, build.family())?;

    for (index, step) in steps.iter().enumerate() {
        match build.cmp_reference(&step.record.version) {
            Ordering::Equal => return Ok(finish(&steps, index, MatchType::Exact)),
            Ordering::Less => {
                if index == 0 {
                    return Err(PatchError::NotFound(format!(
                        "build {build} is older than every known build of {}",
                        build.family()
                    )));
                }
                let mut resolved = finish(&steps, index - 1, MatchType::Approximate);
                resolved.add_warning(format!(
                    "exact build {build} not found, nearest lower build {} used",
                    resolved.version
                ));
                return Ok(resolved);
            }
            Ordering::Greater => {}
        }
    }

    let last = steps.len() - 1;
    let mut resolved = finish(&steps, last, MatchType::Approximate);
    resolved.add_warning(format!(
        "build {build} is newer than the last known build {}; the build reference may be out of date",
        resolved.version
    ));
    Ok(resolved)
}

/// Finds the first build shipped by `kb`, searching every family.
pub fn resolve_by_kb(table: &BuildTable, kb: u32) -> Result<ResolvedBuild, PatchError> {
    for family in table.families() {
        let steps = family_steps(table, family)?;
        if let Some(index) = steps.iter().position(|step| step.record.contains_kb(kb)) {
            return Ok(finish(&steps, index, MatchType::Exact));
        }
    }

    Err(PatchError::NotFound(format!(
        "KB{kb} is not listed in the build reference"
    )))
}

/// Finds the first build of `family` at Service Pack `sp` and, when given,
/// Cumulative Update `cu`.
pub fn resolve_by_family(
    table: &BuildTable,
    family: FamilyKey,
    sp: &str,
    cu: Option<&str>,
) -> Result<ResolvedBuild, PatchError> {
    let steps = family_steps(table, family)?;
    let wanted_sp = normalize_label(sp);
    let wanted_cu = cu.map(normalize_label).filter(|label| !label.is_empty());

    let position = steps.iter().position(|step| {
        normalize_label(step.service_pack) == wanted_sp
            && match &wanted_cu {
                None => true,
                Some(wanted) => step
                    .cumulative_update
                    .is_some_and(|label| normalize_label(label) == *wanted),
            }
    });

    match position {
        Some(index) => Ok(finish(&steps, index, MatchType::Exact)),
        None => Err(PatchError::NotFound(format!(
            "{family} has no build at {wanted_sp}{}",
            wanted_cu.unwrap_or_default()
        ))),
    }
}

/// Last known build of `family`.
pub fn latest_build(table: &BuildTable, family: FamilyKey) -> Result<ResolvedBuild, PatchError> {
    let steps = family_steps(table, family)?;
    Ok(finish(&steps, steps.len() - 1, MatchType::Exact))
}
