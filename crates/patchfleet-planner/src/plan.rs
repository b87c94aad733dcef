use std::cmp::Ordering;
use std::collections::BTreeMap;

use patchfleet_core::{
    Architecture, BuildTable, BuildVersion, Component, ComputerPlan, FamilyKey, InstallerPath,
    PatchError, PlannedHost, UpdateAction,
};
use patchfleet_resolver::{
    compute_compliance_target, latest_build, resolve_by_family, resolve_by_kb,
    resolve_by_version, MatchType, Policy, ResolvedBuild,
};
use tracing::{debug, info, warn};

use crate::spec::{resolve_family, VersionSpec};

/// Simulated state of every instance of one family and architecture on a
/// host. The baseline is the lowest installed build, so one installer run
/// brings all instances forward together.
#[derive(Debug, Clone)]
struct ComponentGroup {
    family: FamilyKey,
    architecture: Architecture,
    major_version: u32,
    baseline: BuildVersion,
    instances: Vec<String>,
}

/// Turns one host's inventory and the requested specs into an ordered plan.
///
/// Works on a private copy of the inventory: after an action is emitted the
/// group's baseline moves to the action's target, so a later spec sees the
/// patched state. Any spec that cannot be resolved fails the whole host.
pub fn plan_host(
    table: &BuildTable,
    computer_name: &str,
    components: &[Component],
    specs: &[VersionSpec],
    continue_run: bool,
) -> Result<ComputerPlan, PatchError> {
    let mut groups = group_components(components);
    let mut plan = ComputerPlan::new(computer_name, continue_run);

    for spec in specs {
        let family_filter = spec
            .family_filter()
            .map(|token| resolve_family(table, token))
            .transpose()?;

        for group in groups.values_mut() {
            if family_filter.is_some_and(|family| family != group.family) {
                continue;
            }

            let targets = targets_for(table, spec, group).map_err(|err| {
                PatchError::Planning(format!(
                    "cannot plan {spec} for {} {} at {}: {err}",
                    group.family, group.architecture, group.baseline
                ))
            })?;

            for target in targets {
                if group.baseline.cmp_reference(&target.version) != Ordering::Less {
                    debug!(
                        host = computer_name,
                        family = %group.family,
                        target = %target.version,
                        "already at or past target"
                    );
                    continue;
                }
                if let Some(warning) = &target.warning {
                    warn!(host = computer_name, target = %target.version, "{warning}");
                }
                let action = build_action(group, &target)?;
                group.baseline = target.version;
                plan.actions.push(action);
            }
        }
    }

    info!(
        host = computer_name,
        actions = plan.actions.len(),
        "planned host"
    );
    Ok(plan)
}

/// Plans a host from its inventory result; an inventory or planning failure
/// becomes the host's recorded error.
pub fn plan_inventory(
    table: &BuildTable,
    computer_name: &str,
    inventory: Result<Vec<Component>, PatchError>,
    specs: &[VersionSpec],
    continue_run: bool,
) -> PlannedHost {
    let planned = inventory
        .and_then(|components| plan_host(table, computer_name, &components, specs, continue_run));
    match planned {
        Ok(plan) => PlannedHost::planned(plan),
        Err(err) => {
            warn!(host = computer_name, error = %err, "host will not be patched");
            PlannedHost::failed(computer_name, err)
        }
    }
}

fn group_components(components: &[Component]) -> BTreeMap<(FamilyKey, Architecture), ComponentGroup> {
    let mut groups: BTreeMap<(FamilyKey, Architecture), ComponentGroup> = BTreeMap::new();
    for component in components {
        let key = (component.family(), component.architecture);
        let group = groups.entry(key).or_insert_with(|| ComponentGroup {
            family: component.family(),
            architecture: component.architecture,
            major_version: component.major_version,
            baseline: component.current_version,
            instances: Vec::new(),
        });
        if component.current_version < group.baseline {
            group.baseline = component.current_version;
        }
        group.instances.push(component.instance_name.clone());
    }
    groups
}

fn targets_for(
    table: &BuildTable,
    spec: &VersionSpec,
    group: &ComponentGroup,
) -> Result<Vec<ResolvedBuild>, PatchError> {
    match spec {
        VersionSpec::Build(version) => {
            if version.family() != group.family {
                return Ok(Vec::new());
            }
            resolve_by_version(table, &group.baseline)?;
            let resolved = resolve_by_version(table, version)?;
            if resolved.match_type != MatchType::Exact {
                return Err(PatchError::NotFound(format!(
                    "build {version} is not listed in the build reference"
                )));
            }
            Ok(vec![resolved])
        }
        VersionSpec::Kb(kb) => {
            let resolved = resolve_by_kb(table, *kb)?;
            if resolved.family != group.family {
                return Ok(Vec::new());
            }
            resolve_by_version(table, &group.baseline)?;
            Ok(vec![resolved])
        }
        VersionSpec::Level {
            service_pack,
            cumulative_update,
            ..
        } => {
            let installed = installed_with_forward_path(table, group)?;
            let service_pack = service_pack
                .clone()
                .unwrap_or_else(|| installed.service_pack.clone());
            let target = resolve_by_family(
                table,
                group.family,
                &service_pack,
                cumulative_update.as_deref(),
            )?;
            Ok(vec![target])
        }
        VersionSpec::Latest { .. } => {
            installed_with_forward_path(table, group)?;
            let latest = latest_build(table, group.family)?;
            let latest_service_pack =
                resolve_by_family(table, group.family, &latest.service_pack, None)?;
            Ok(vec![latest_service_pack, latest])
        }
        VersionSpec::Policy(policy) => policy_target(table, policy, group),
    }
}

/// Target of a compliance policy for one group. A minimum build only binds
/// its own family and resolves to the first known build at or above it.
fn policy_target(
    table: &BuildTable,
    policy: &Policy,
    group: &ComponentGroup,
) -> Result<Vec<ResolvedBuild>, PatchError> {
    if let Policy::MinimumBuild(minimum) = policy {
        if minimum.family() != group.family
            || group.baseline.cmp_reference(minimum) != Ordering::Less
        {
            return Ok(Vec::new());
        }
    }

    resolve_by_version(table, &group.baseline)?;
    let target = compute_compliance_target(table, group.family, policy)?;
    let reachable = table
        .family_records(group.family)
        .iter()
        .find(|record| record.version.cmp_reference(&target.version) != Ordering::Less)
        .ok_or_else(|| {
            PatchError::NotFound(format!(
                "no known build of {} reaches {} ({policy})",
                group.family, target.version
            ))
        })?;

    let mut resolved = resolve_by_version(table, &reachable.version)?;
    if !target.warnings.is_empty() {
        let clamped = target.warnings.join("; ");
        resolved.warning = Some(match resolved.warning.take() {
            Some(existing) => format!("{existing}; {clamped}"),
            None => clamped,
        });
    }
    Ok(vec![resolved])
}
