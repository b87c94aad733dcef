use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use patchfleet_core::{
    ComputerPlan, ExecutionResult, FleetReport, Outcome, PatchError, PlannedHost, UpdateAction,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::auth::{AuthNegotiator, Negotiated};
use crate::gate::{GateDecision, RebootGate};
use crate::installer::{is_unc_path, run_installer, InstallOutcome};
use crate::traits::{Backend, Credential, HostControl};

pub const DEFAULT_THROTTLE: usize = 50;
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REMOTE_MEDIA_DIR: &str = r"C:\Windows\Temp\patchfleet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Hosts processed at the same time.
    pub throttle: usize,
    pub restart: bool,
    pub dry_run: bool,
    pub restart_timeout: Duration,
    pub remote_media_dir: String,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            restart: false,
            dry_run: false,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
            remote_media_dir: DEFAULT_REMOTE_MEDIA_DIR.to_string(),
        }
    }
}

/// Runs planned hosts with bounded parallelism. Actions of one host run in
/// plan order on that host's task; every result is sent on the event
/// channel as soon as it exists.
pub struct Coordinator {
    runner: Arc<HostRunner>,
    throttle: usize,
    dry_run: bool,
}

struct HostRunner {
    host_control: Arc<dyn HostControl>,
    negotiator: Arc<AuthNegotiator>,
    gate: RebootGate,
    credential: Credential,
    options: ExecutionOptions,
}

struct HostLog<'a> {
    events: &'a mpsc::UnboundedSender<ExecutionResult>,
    results: Vec<ExecutionResult>,
}

impl HostLog<'_> {
    fn emit(&mut self, result: ExecutionResult) {
        // A dropped receiver only stops progress output; the report still
        // gets every result.
        let _ = self.events.send(result.clone());
        self.results.push(result);
    }
}

impl Coordinator {
    pub fn new(
        backend: &Backend,
        negotiator: Arc<AuthNegotiator>,
        credential: Credential,
        options: ExecutionOptions,
    ) -> Self {
        let throttle = options.throttle.max(1);
        let dry_run = options.dry_run;
        let gate = RebootGate::new(Arc::clone(&backend.host_control), options.restart);
        Self {
            runner: Arc::new(HostRunner {
                host_control: Arc::clone(&backend.host_control),
                negotiator,
                gate,
                credential,
                options,
            }),
            throttle,
            dry_run,
        }
    }

    pub async fn run(
        &self,
        hosts: Vec<PlannedHost>,
        events: mpsc::UnboundedSender<ExecutionResult>,
    ) -> FleetReport {
        let mut report = FleetReport::default();
        let semaphore = Arc::new(Semaphore::new(self.throttle));
        let mut set = JoinSet::new();

        for host in hosts {
            let plan = match host.plan {
                Ok(plan) => plan,
                Err(err) => {
                    let mut log = HostLog {
                        events: &events,
                        results: Vec::new(),
                    };
                    log.emit(ExecutionResult::host_level(
                        &host.computer_name,
                        Outcome::Failed,
                        Some(&err),
                        err.to_string(),
                    ));
                    log.results.into_iter().for_each(|result| report.record(result));
                    continue;
                }
            };

            if self.dry_run {
                let mut log = HostLog {
                    events: &events,
                    results: Vec::new(),
                };
                for result in dry_run_results(&plan) {
                    log.emit(result);
                }
                log.results.into_iter().for_each(|result| report.record(result));
                continue;
            }

            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&semaphore);
            let events = events.clone();
            let span = info_span!("host", host = %plan.computer_name);
            set.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        error!("host throttle closed");
                        return Vec::new();
                    };
                    runner.run_host(plan, &events).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => results.into_iter().for_each(|result| report.record(result)),
                Err(err) => error!(error = %err, "host task did not complete"),
            }
        }

        report
    }
}

impl HostRunner {
    async fn run_host(
        &self,
        plan: ComputerPlan,
        events: &mpsc::UnboundedSender<ExecutionResult>,
    ) -> Vec<ExecutionResult> {
        let host = plan.computer_name.clone();
        let continue_run = plan.continue_run;
        let mut log = HostLog {
            events,
            results: Vec::new(),
        };

        if plan.actions.is_empty() {
            log.emit(ExecutionResult::host_level(
                &host,
                Outcome::UpToDate,
                None,
                "every component is already at the requested build",
            ));
            return log.results;
        }

        info!(host, actions = plan.actions.len(), "patching host");
        let mut channel: Option<Negotiated> = None;
        let mut stop: Option<String> = None;

        for (index, mut action) in plan.actions.into_iter().enumerate() {
            let started_at = Utc::now();
            if let Some(reason) = &stop {
                log.emit(action_result(
                    &host,
                    action,
                    Outcome::Skipped,
                    None,
                    started_at,
                    vec![reason.clone()],
                ));
                continue;
            }

            let mut notes = Vec::new();
            let step = self
                .run_action(&host, &mut action, index == 0, continue_run, &mut channel, &mut notes)
                .await;
            match step {
                Ok(after) => {
                    stop = after;
                    log.emit(action_result(
                        &host,
                        action,
                        Outcome::Succeeded,
                        None,
                        started_at,
                        notes,
                    ));
                }
                Err(err) => {
                    warn!(host, kb = action.kb, error = %err, "action failed");
                    stop = Some(format!(
                        "not attempted: {} failed on {host} ({})",
                        action.kb_label(),
                        err.kind()
                    ));
                    notes.push(err.to_string());
                    log.emit(action_result(
                        &host,
                        action,
                        Outcome::Failed,
                        Some(&err),
                        started_at,
                        notes,
                    ));
                }
            }
        }

        log.results
    }

    /// Runs one action. `Ok(Some(reason))` means it succeeded but the rest of
    /// the host's plan must not run.
    async fn run_action(
        &self,
        host: &str,
        action: &mut UpdateAction,
        first_action: bool,
        continue_run: bool,
        channel: &mut Option<Negotiated>,
        notes: &mut Vec<String>,
    ) -> Result<Option<String>, PatchError> {
        match self
            .gate
            .check(host, &self.credential, first_action, continue_run)
            .await?
        {
            GateDecision::Proceed => {}
            GateDecision::ProceedDespitePending => {
                notes.push("reboot pending from a previous run; continuing without restart".to_string())
            }
            GateDecision::RestartFirst => {
                self.restart_and_wait(host).await?;
                *channel = None;
                notes.push("restarted to clear a pending reboot".to_string());
            }
        }

        let negotiated = match channel.take() {
            Some(negotiated) => negotiated,
            None => {
                let negotiated = self.negotiator.negotiate(host, &self.credential).await?;
                if negotiated.used_fallback {
                    notes.push(format!(
                        "connected with fallback protocol {}",
                        negotiated.protocol
                    ));
                }
                negotiated
            }
        };

        let remote_path = self.stage_media(host, action).await?;
        let outcome =
            run_installer(negotiated.channel.as_ref(), host, &remote_path, action).await?;
        // The install itself went through even if the restart below fails.
        action.successful = true;

        match outcome {
            InstallOutcome::Completed => {
                *channel = Some(negotiated);
                Ok(None)
            }
            InstallOutcome::RestartRequired => {
                action.restart_required = true;
                if !self.options.restart {
                    notes.push("installer requested a restart".to_string());
                    return Ok(Some(format!(
                        "not attempted: {host} needs a restart after {} and automatic restart is disabled",
                        action.kb_label()
                    )));
                }
                drop(negotiated);
                self.restart_and_wait(host).await?;
                action.restarted = true;
                notes.push("restarted after install".to_string());
                Ok(None)
            }
        }
    }

    async fn stage_media(&self, host: &str, action: &UpdateAction) -> Result<String, PatchError> {
        let local = action.installer.local().ok_or_else(|| {
            PatchError::Copy(format!("{} has no local installer media", action.kb_label()))
        })?;
        if is_unc_path(local) {
            return Ok(local.display().to_string());
        }
        self.host_control
            .copy_file(host, &self.credential, local, &self.options.remote_media_dir)
            .await
    }

    async fn restart_and_wait(&self, host: &str) -> Result<(), PatchError> {
        info!(host, "restarting host");
        self.host_control.restart(host, &self.credential).await?;

        let timeout = self.options.restart_timeout;
        let reachable = tokio::time::timeout(
            timeout,
            self.host_control.wait_until_reachable(host, timeout),
        )
        .await;
        match reachable {
            Ok(true) => {
                info!(host, "host is reachable again");
                Ok(())
            }
            Ok(false) | Err(_) => Err(PatchError::NotReachable(format!(
                "{host} did not come back within {}s of restarting",
                timeout.as_secs()
            ))),
        }
    }
}

fn dry_run_results(plan: &ComputerPlan) -> Vec<ExecutionResult> {
    if plan.actions.is_empty() {
        return vec![ExecutionResult::host_level(
            &plan.computer_name,
            Outcome::UpToDate,
            None,
            "every component is already at the requested build",
        )];
    }

    plan.actions
        .iter()
        .map(|action| {
            let note = format!("what if: would install {}", action.describe());
            action_result(
                &plan.computer_name,
                action.clone(),
                Outcome::DryRun,
                None,
                Utc::now(),
                vec![note],
            )
        })
        .collect()
}

fn action_result(
    host: &str,
    mut action: UpdateAction,
    outcome: Outcome,
    error: Option<&PatchError>,
    started_at: DateTime<Utc>,
    notes: Vec<String>,
) -> ExecutionResult {
    action.notes.extend(notes.iter().cloned());
    ExecutionResult {
        computer_name: host.to_string(),
        action: Some(action),
        outcome,
        error: error.map(PatchError::kind),
        started_at,
        finished_at: Utc::now(),
        notes,
    }
}
