use std::cmp::Ordering;

use patchfleet_core::{normalize_label, BuildTable, BuildVersion, FamilyKey, PatchError, WalkStep};

use crate::resolve::{family_steps, resolve_by_version};
use crate::types::{ComplianceReport, ComplianceTarget, Policy};

/// Build an installation of `family` must reach to satisfy `policy`.
pub fn compute_compliance_target(
    table: &BuildTable,
    family: FamilyKey,
    policy: &Policy,
) -> Result<ComplianceTarget, PatchError> {
    match policy {
        Policy::MinimumBuild(version) => Ok(ComplianceTarget {
            family,
            version: *version,
            service_pack: None,
            cumulative_update: None,
            warnings: Vec::new(),
        }),
        Policy::Latest => {
            let steps = family_steps(table, family)?;
            let last = steps.len() - 1;
            Ok(target_from_step(family, &steps[last], Vec::new()))
        }
        Policy::MaxBehind {
            sp_behind,
            cu_behind,
        } => max_behind_target(table, family, *sp_behind, *cu_behind),
    }
}

fn max_behind_target(
    table: &BuildTable,
    family: FamilyKey,
    sp_behind: Option<u32>,
    cu_behind: Option<u32>,
) -> Result<ComplianceTarget, PatchError> {
    let steps = family_steps(table, family)?;
    let mut warnings = Vec::new();

    let service_packs = distinct_labels(steps.iter().map(|step| Some(step.service_pack)));
    let sp_index = behind_index(service_packs.len(), sp_behind.unwrap_or(0));
    let sp_index = match sp_index {
        Some(index) => index,
        None => {
            warnings.push(format!(
                "{family} only has {} known service pack level(s); {} behind was clamped to the earliest, {}",
                service_packs.len(),
                sp_behind.unwrap_or(0),
                service_packs[0]
            ));
            0
        }
    };
    let target_sp = &service_packs[sp_index];

    let segment = steps
        .iter()
        .filter(|step| normalize_label(step.service_pack) == *target_sp)
        .collect::<Vec<_>>();

    let chosen_cu = cu_behind.and_then(|cu_behind| {
        let cumulative_updates =
            distinct_labels(segment.iter().map(|step| step.cumulative_update));
        behind_index(cumulative_updates.len(), cu_behind)
            .map(|index| cumulative_updates[index].clone())
    });

    let chosen = segment
        .iter()
        .rev()
        .find(|step| match &chosen_cu {
            Some(label) => step
                .cumulative_update
                .is_some_and(|cu| normalize_label(cu) == *label),
            None => step.cumulative_update.is_none(),
        })
        .ok_or_else(|| {
            PatchError::NotFound(format!(
                "{family} has no build at {target_sp}{}",
                chosen_cu.clone().unwrap_or_default()
            ))
        })?;

    Ok(target_from_step(family, chosen, warnings))
}

/// Checks `installed` against the target for its family.
///
/// The verdict is a plain build comparison. Placing the installed build in
/// the reference is informational, so a build the reference does not know
/// yields a warning rather than an error.
pub fn test_compliance(
    table: &BuildTable,
    installed: &BuildVersion,
    policy: &Policy,
) -> Result<ComplianceReport, PatchError> {
    let target = compute_compliance_target(table, installed.family(), policy)?;
    let compliant = installed.cmp_reference(&target.version) != Ordering::Less;

    let mut warnings = Vec::new();
    let resolved = match resolve_by_version(table, installed) {
        Ok(resolved) => {
            warnings.extend(resolved.warning.clone());
            Some(resolved)
        }
        Err(err) => {
            warnings.push(format!(
                "installed build {installed} is not placed by the build reference: {err}"
            ));
            None
        }
    };

    Ok(ComplianceReport {
        installed_version: *installed,
        installed: resolved,
        warnings,
        target,
        compliant,
    })
}

fn target_from_step(family: FamilyKey, step: &WalkStep<'_>, warnings: Vec<String>) -> ComplianceTarget {
    ComplianceTarget {
        family,
        version: step.record.version,
        service_pack: Some(step.service_pack.to_string()),
        cumulative_update: step.cumulative_update.map(str::to_string),
        warnings,
    }
}

/// `count - behind - 1`, or `None` when that falls before the first entry.
fn behind_index(count: usize, behind: u32) -> Option<usize> {
    count.checked_sub(behind as usize + 1)
}

fn distinct_labels<'a>(labels: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
    let mut distinct: Vec<String> = Vec::new();
    for label in labels.flatten() {
        let normalized = normalize_label(label);
        if distinct.last() != Some(&normalized) {
            distinct.push(normalized);
        }
    }
    distinct
}
