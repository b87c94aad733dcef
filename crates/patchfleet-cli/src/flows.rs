use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use patchfleet_core::{parse_kb, BuildVersion, PatchError, PlannedHost};
use patchfleet_executor::{
    plan_fleet, AlwaysApprove, AuthNegotiator, Backend, Coordinator, DeclineFallback,
    FallbackApprover, PlanRequest, ScriptedBackend,
};
use patchfleet_planner::{
    apply_downloads, fail_pending_downloads, resolve_installers, DownloadQueue, HttpDownloader,
    MediaIndex, VersionSpec,
};
use patchfleet_registry::{LoadedReference, RefreshStatus};
use patchfleet_resolver::{resolve_by_kb, resolve_by_version, test_compliance, Policy};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::prompt::TerminalApprover;
use crate::render::{
    format_compliance_lines, format_resolved_lines, format_result_line,
    format_update_summary_line, TerminalRenderer,
};
use crate::{TestBuildArgs, UpdateArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildQuery {
    Version(BuildVersion),
    Kb(u32),
}

pub fn parse_build_query(input: &str) -> Result<BuildQuery> {
    let trimmed = input.trim();
    if trimmed.contains('.') {
        return BuildVersion::parse(trimmed).map(BuildQuery::Version);
    }
    parse_kb(trimmed).map(BuildQuery::Kb).ok_or_else(|| {
        anyhow!("'{input}' is neither a build like 15.0.4033.1 nor a KB like KB4548597")
    })
}

/// `--version`, `--kb`, then the policy; nothing at all means Latest.
pub fn collect_specs(
    versions: &[String],
    kbs: &[String],
    policy: Option<Policy>,
) -> Result<Vec<VersionSpec>> {
    let mut specs = Vec::with_capacity(versions.len() + kbs.len());
    for version in versions {
        specs.push(VersionSpec::parse(version)?);
    }
    for kb in kbs {
        let kb = parse_kb(kb).ok_or_else(|| anyhow!("invalid KB '{kb}'"))?;
        specs.push(VersionSpec::Kb(kb));
    }
    specs.extend(policy.map(VersionSpec::Policy));
    if specs.is_empty() {
        specs.push(VersionSpec::Latest { family: None });
    }
    Ok(specs)
}

pub fn parse_policy(args: &TestBuildArgs) -> Result<Policy> {
    if args.latest {
        return Ok(Policy::Latest);
    }
    if let Some(minimum) = &args.minimum_build {
        return BuildVersion::parse(minimum).map(Policy::MinimumBuild);
    }
    match &args.max_behind {
        Some(max_behind) => Policy::parse_max_behind(max_behind),
        None => Err(anyhow!(
            "one of --latest, --minimum-build or --max-behind is required"
        )),
    }
}

pub fn update_policy(args: &UpdateArgs) -> Result<Option<Policy>> {
    if let Some(minimum) = &args.minimum_build {
        return BuildVersion::parse(minimum).map(|version| Some(Policy::MinimumBuild(version)));
    }
    args.max_behind
        .as_deref()
        .map(Policy::parse_max_behind)
        .transpose()
}

pub fn fallback_approver(assume_yes: bool, interactive: bool) -> Arc<dyn FallbackApprover> {
    if assume_yes {
        Arc::new(AlwaysApprove)
    } else if interactive {
        Arc::new(TerminalApprover::default())
    } else {
        Arc::new(DeclineFallback)
    }
}

pub fn load_reference(config: &Config, renderer: TerminalRenderer) -> Result<LoadedReference> {
    let store = config.reference_store()?;
    let reference = store
        .load()
        .context("cannot continue without a build reference")?;
    info!(
        origin = reference.origin.as_str(),
        records = reference.table.len(),
        "build reference loaded"
    );
    if let Some(warning) = reference.staleness_warning(Utc::now()) {
        renderer.print_warning(&warning);
    }
    Ok(reference)
}

pub fn run_build_command(
    config: &Config,
    queries: &[String],
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let reference = load_reference(config, renderer)?;
    let mut failed = false;

    for query in queries {
        let resolved = parse_build_query(query).and_then(|parsed| {
            let resolved = match parsed {
                BuildQuery::Version(version) => resolve_by_version(&reference.table, &version),
                BuildQuery::Kb(kb) => resolve_by_kb(&reference.table, kb),
            };
            resolved.map_err(anyhow::Error::from)
        });

        match resolved {
            Ok(resolved) => {
                renderer.print_lines(&format_resolved_lines(query, &resolved));
                if let Some(warning) = &resolved.warning {
                    renderer.print_warning(&format!("{query}: {warning}"));
                }
            }
            Err(err) => {
                failed = true;
                renderer.print_error(&format!("{query}: {err:#}"));
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

pub fn run_test_build_command(
    config: &Config,
    args: &TestBuildArgs,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let installed = BuildVersion::parse(&args.build)?;
    let policy = parse_policy(args)?;
    let reference = load_reference(config, renderer)?;

    let report = test_compliance(&reference.table, &installed, &policy)?;
    renderer.print_lines(&format_compliance_lines(&report));
    for warning in report.warnings.iter().chain(report.target.warnings.iter()) {
        renderer.print_warning(warning);
    }

    if report.compliant {
        renderer.print_status("ok", &format!("{installed} satisfies {policy}"));
        Ok(ExitCode::SUCCESS)
    } else {
        renderer.print_status(
            "error",
            &format!("{installed} does not satisfy {policy}"),
        );
        Ok(ExitCode::FAILURE)
    }
}

pub fn run_update_reference_command(
    config: &Config,
    url: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let store = config.reference_store()?;
    let source = config.reference_source(url);

    match store.refresh(&source) {
        Ok(outcome) => {
            let message = match outcome.status {
                RefreshStatus::Updated => format!(
                    "build reference updated: {} builds, published {}",
                    outcome.reference.table.len(),
                    outcome.reference.last_updated.format("%Y-%m-%d")
                ),
                RefreshStatus::UpToDate => "build reference is already up to date".to_string(),
            };
            renderer.print_status("ok", &message);
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ PatchError::Network(_)) => {
            renderer.print_warning(&format!(
                "{err}; keeping the cached reference at {}",
                store.cache_path().display()
            ));
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn run_update_command(
    config: &Config,
    args: &UpdateArgs,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let specs = collect_specs(&args.versions, &args.kbs, update_policy(args)?)?;
    let (primary, fallback) = config.protocols(args.protocol, args.fallback_protocol)?;
    let options = config.execution_options(args.throttle, args.restart, args.dry_run);
    let credential = config.credential(args.username.as_deref());
    let reference = load_reference(config, renderer)?;
    let table = Arc::new(reference.table);

    let mut scripted = ScriptedBackend::new(config.backend.clone());
    if let Some(secs) = config.execution.poll_interval_secs {
        scripted = scripted.with_poll_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = config.execution.command_timeout_secs {
        scripted = scripted.with_command_timeout(Duration::from_secs(secs));
    }
    let backend = Backend::from_shared(Arc::new(scripted));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    renderer.print_section("inventory");
    let request = Arc::new(PlanRequest {
        specs,
        continue_run: args.continue_run,
    });
    let mut hosts = runtime.block_on(plan_fleet(
        Arc::clone(&backend.inventory),
        &credential,
        Arc::clone(&table),
        request,
        &args.computers,
        options.throttle,
    ));

    let repositories = config.repositories(&args.repositories);
    let index = MediaIndex::scan(&repositories);
    for path in index.unreadable() {
        renderer.print_warning(&format!("skipped unreadable media repository {}", path.display()));
    }
    // What-if runs report missing media as pending downloads instead of failing.
    let queue = resolve_installers(&mut hosts, &index, args.download || args.dry_run);
    if !args.dry_run && !queue.is_empty() {
        download_missing(config, &repositories, &mut hosts, &queue, renderer);
    }

    let interactive = std::io::stdin().is_terminal();
    let negotiator = Arc::new(AuthNegotiator::new(
        Arc::clone(&backend.transport),
        fallback_approver(args.yes, interactive),
        primary,
        fallback,
    ));
    let coordinator = Coordinator::new(&backend, negotiator, credential, options);

    renderer.print_section("update");
    let total = expected_results(&hosts);
    let report = runtime.block_on(async {
        let (events, mut receiver) = mpsc::unbounded_channel();
        let printer = async move {
            let mut progress = renderer.start_progress("update", total);
            while let Some(result) = receiver.recv().await {
                progress.println(&format_result_line(&result, renderer.style()));
                progress.inc();
            }
            progress.finish_success();
        };
        let (report, ()) = tokio::join!(coordinator.run(hosts, events), printer);
        report
    });

    renderer.print_status(
        if report.has_failures() { "error" } else { "ok" },
        &format_update_summary_line(&report),
    );
    if !report.has_failures() {
        return Ok(ExitCode::SUCCESS);
    }
    renderer.print_error(&format!(
        "failed hosts: {}",
        report.failed_hosts().join(", ")
    ));
    Ok(ExitCode::FAILURE)
}

/// Fetches queued installers. A missing download source or directory fails
/// only the hosts that were waiting on a download.
pub(crate) fn download_missing(
    config: &Config,
    repositories: &[PathBuf],
    hosts: &mut [PlannedHost],
    queue: &DownloadQueue,
    renderer: TerminalRenderer,
) {
    let Some(template) = config.media.download_url_template.as_deref() else {
        let error = PatchError::Download(format!(
            "{} installer(s) are missing and [media] download_url_template is not set",
            queue.len()
        ));
        renderer.print_error(&error.to_string());
        fail_pending_downloads(hosts, &error);
        return;
    };
    let destination = config
        .download_dir(repositories)
        .unwrap_or_else(|| std::env::temp_dir().join("patchfleet-media"));
    if let Err(err) = std::fs::create_dir_all(&destination) {
        let error = PatchError::Download(format!(
            "failed to create download directory {}: {err}",
            destination.display()
        ));
        renderer.print_error(&error.to_string());
        fail_pending_downloads(hosts, &error);
        return;
    }

    renderer.print_section("download");
    let downloader = HttpDownloader::new(template);
    let summary = apply_downloads(hosts, queue, &downloader, &destination);
    for (request, path) in &summary.downloaded {
        renderer.print_status(
            "ok",
            &format!("downloaded KB{} ({}) to {}", request.kb, request.architecture, path.display()),
        );
    }
    for (request, err) in &summary.failed {
        renderer.print_error(&format!("KB{} ({}): {err}", request.kb, request.architecture));
    }
}

/// One result per action, or one per host without actions.
fn expected_results(hosts: &[PlannedHost]) -> u64 {
    hosts
        .iter()
        .map(|host| host.actions().len().max(1) as u64)
        .sum()
}
