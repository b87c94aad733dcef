use super::*;
use async_trait::async_trait;
use patchfleet_core::{
    Architecture, BuildRecord, BuildTable, BuildVersion, Component, ComputerPlan, ErrorKind,
    ExecutionResult, FamilyKey, FleetReport, InstallerPath, Outcome, PatchError, PlannedHost,
    UpdateAction,
};
use patchfleet_planner::VersionSpec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockConfig {
    inventories: HashMap<String, Vec<Component>>,
    pending_reboot: HashSet<String>,
    never_back: HashSet<String>,
    rejected: HashMap<String, HashSet<AuthProtocol>>,
    credssp_fixes: HashSet<String>,
    exit_codes: HashMap<(String, u32), i32>,
    install_delay: Duration,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    pending: HashSet<String>,
    credssp_ready: HashSet<String>,
    intervals: Vec<(String, Instant, Instant)>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Clone)]
struct MockBackend {
    config: Arc<MockConfig>,
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    fn new(config: MockConfig) -> Self {
        let state = MockState {
            pending: config.pending_reboot.clone(),
            ..MockState::default()
        };
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn record(&self, call: String) {
        self.state.lock().expect("mock state").calls.push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().expect("mock state").calls.clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Inventory for MockBackend {
    async fn collect_components(
        &self,
        host: &str,
        _credential: &Credential,
    ) -> Result<Vec<Component>, PatchError> {
        self.record(format!("inventory {host}"));
        self.config
            .inventories
            .get(host)
            .cloned()
            .ok_or_else(|| PatchError::Connection(format!("{host}: WinRM unreachable")))
    }
}

#[async_trait]
impl HostControl for MockBackend {
    async fn pending_reboot(&self, host: &str, _credential: &Credential) -> Result<bool, PatchError> {
        self.record(format!("pending {host}"));
        Ok(self.state.lock().expect("mock state").pending.contains(host))
    }

    async fn restart(&self, host: &str, _credential: &Credential) -> Result<(), PatchError> {
        self.record(format!("restart {host}"));
        self.state.lock().expect("mock state").pending.remove(host);
        Ok(())
    }

    async fn wait_until_reachable(&self, host: &str, timeout: Duration) -> bool {
        self.record(format!("wait {host}"));
        if self.config.never_back.contains(host) {
            tokio::time::sleep(timeout * 10).await;
            return false;
        }
        true
    }

    async fn copy_file(
        &self,
        host: &str,
        _credential: &Credential,
        local_path: &Path,
        remote_dir: &str,
    ) -> Result<String, PatchError> {
        let file_name = local_path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("installer.exe");
        self.record(format!("copy {host} {}", local_path.display()));
        Ok(format!(r"{remote_dir}\{file_name}"))
    }
}

#[async_trait]
impl Transport for MockBackend {
    async fn connect(
        &self,
        host: &str,
        _credential: &Credential,
        protocol: AuthProtocol,
    ) -> Result<Box<dyn RemoteChannel>, PatchError> {
        self.record(format!("connect {host} {protocol}"));
        let rejected = self
            .config
            .rejected
            .get(host)
            .is_some_and(|protocols| protocols.contains(&protocol));
        let fixed = protocol == AuthProtocol::Credssp
            && self
                .state
                .lock()
                .expect("mock state")
                .credssp_ready
                .contains(host);
        if rejected && !fixed {
            return Err(PatchError::Auth(format!("{host} rejected {protocol}")));
        }
        Ok(Box::new(MockChannel {
            backend: self.clone(),
            host: host.to_string(),
            protocol,
        }))
    }

    async fn configure_credssp(&self, host: &str, _credential: &Credential) -> Result<(), PatchError> {
        self.record(format!("credssp {host}"));
        if self.config.credssp_fixes.contains(host) {
            self.state
                .lock()
                .expect("mock state")
                .credssp_ready
                .insert(host.to_string());
            Ok(())
        } else {
            Err(PatchError::Auth(format!("{host}: WSMan delegation denied")))
        }
    }
}

struct MockChannel {
    backend: MockBackend,
    host: String,
    protocol: AuthProtocol,
}

#[async_trait]
impl RemoteChannel for MockChannel {
    fn protocol(&self) -> AuthProtocol {
        self.protocol
    }

    async fn execute(&self, command: &RemoteCommand) -> Result<CommandOutput, PatchError> {
        let kb = kb_from_program(&command.program);
        self.backend.record(format!("install {} {}", self.host, command.program));
        let started = Instant::now();
        {
            let mut state = self.backend.state.lock().expect("mock state");
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        tokio::time::sleep(self.backend.config.install_delay).await;
        {
            let mut state = self.backend.state.lock().expect("mock state");
            state.in_flight -= 1;
            state
                .intervals
                .push((self.host.clone(), started, Instant::now()));
        }
        let exit_code = self
            .backend
            .config
            .exit_codes
            .get(&(self.host.clone(), kb))
            .copied()
            .unwrap_or(0);
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 1603 {
                "fatal error during installation".to_string()
            } else {
                String::new()
            },
        })
    }
}

fn kb_from_program(program: &str) -> u32 {
    program
        .rsplit(['\\', '/'])
        .next()
        .and_then(|name| name.strip_prefix("KB"))
        .and_then(|rest| rest.split('-').next())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

fn action(kb: u32) -> UpdateAction {
    UpdateAction {
        major_version: 15,
        family: FamilyKey::new(15, 0),
        architecture: Architecture::X64,
        kb,
        target_version: BuildVersion::new(15, 0, kb % 10_000, None),
        service_pack: "RTM".to_string(),
        cumulative_update: Some(format!("CU{}", kb % 100)),
        instances: vec!["MSSQLSERVER".to_string()],
        installer: InstallerPath::Local(PathBuf::from(format!("/media/KB{kb}-x64.exe"))),
        restart_required: false,
        successful: false,
        restarted: false,
        notes: Vec::new(),
    }
}

fn planned(host: &str, kbs: &[u32], continue_run: bool) -> PlannedHost {
    let mut plan = ComputerPlan::new(host, continue_run);
    plan.actions = kbs.iter().copied().map(action).collect();
    PlannedHost::planned(plan)
}

struct Harness {
    backend: MockBackend,
    options: ExecutionOptions,
    primary: AuthProtocol,
    fallback: Option<AuthProtocol>,
    approver: Arc<dyn FallbackApprover>,
}

impl Harness {
    fn new(config: MockConfig) -> Self {
        Self {
            backend: MockBackend::new(config),
            options: ExecutionOptions {
                restart_timeout: Duration::from_millis(50),
                ..ExecutionOptions::default()
            },
            primary: AuthProtocol::Default,
            fallback: None,
            approver: Arc::new(DeclineFallback),
        }
    }

    async fn run(&self, hosts: Vec<PlannedHost>) -> (FleetReport, Vec<ExecutionResult>) {
        let backend = Backend::from_shared(Arc::new(self.backend.clone()));
        let negotiator = Arc::new(AuthNegotiator::new(
            Arc::clone(&backend.transport),
            Arc::clone(&self.approver),
            self.primary,
            self.fallback,
        ));
        let coordinator = Coordinator::new(
            &backend,
            negotiator,
            Credential::new("CONTOSO\\dba", Some("secret".to_string())),
            self.options.clone(),
        );

        let (events, mut receiver) = mpsc::unbounded_channel();
        let report = coordinator.run(hosts, events).await;
        let mut streamed = Vec::new();
        while let Some(result) = receiver.recv().await {
            streamed.push(result);
        }
        (report, streamed)
    }
}

fn outcomes(report: &FleetReport, host: &str) -> Vec<Outcome> {
    report.host(host).iter().map(|result| result.outcome).collect()
}

#[tokio::test]
async fn throttle_of_one_runs_hosts_sequentially() {
    let mut harness = Harness::new(MockConfig {
        install_delay: Duration::from_millis(40),
        ..MockConfig::default()
    });
    harness.options.throttle = 1;

    let started = Instant::now();
    let (report, _) = harness
        .run(vec![
            planned("sql01", &[5000642], false),
            planned("sql02", &[5000642], false),
            planned("sql03", &[5000642], false),
        ])
        .await;
    let elapsed = started.elapsed();

    assert!(!report.has_failures());
    assert!(elapsed >= Duration::from_millis(120), "elapsed {elapsed:?}");

    let mut intervals = harness
        .backend
        .state
        .lock()
        .expect("mock state")
        .intervals
        .clone();
    intervals.sort_by_key(|(_, start, _)| *start);
    assert_eq!(intervals.len(), 3);
    for pair in intervals.windows(2) {
        assert!(
            pair[1].1 >= pair[0].2,
            "{} started before {} finished",
            pair[1].0,
            pair[0].0
        );
    }
}

#[tokio::test]
async fn hosts_run_concurrently_up_to_throttle() {
    let mut harness = Harness::new(MockConfig {
        install_delay: Duration::from_millis(60),
        ..MockConfig::default()
    });
    harness.options.throttle = 2;

    let hosts = (1..=4)
        .map(|index| planned(&format!("sql0{index}"), &[5000642], false))
        .collect();
    let (report, _) = harness.run(hosts).await;

    assert!(!report.has_failures());
    let max_in_flight = harness.backend.state.lock().expect("mock state").max_in_flight;
    assert_eq!(max_in_flight, 2);
}

#[tokio::test]
async fn host_that_never_returns_skips_remaining_actions_without_blocking() {
    let mut harness = Harness::new(MockConfig {
        never_back: HashSet::from(["sql01".to_string()]),
        exit_codes: HashMap::from([(("sql01".to_string(), 5000642), 3010)]),
        ..MockConfig::default()
    });
    harness.options.restart = true;

    let started = Instant::now();
    let (report, _) = harness
        .run(vec![
            planned("sql01", &[5000642, 5001090, 5003249], false),
            planned("sql02", &[5000642], false),
        ])
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Failed, Outcome::Skipped, Outcome::Skipped]
    );
    let results = report.host("sql01");
    assert_eq!(results[0].error, Some(ErrorKind::NotReachable));
    let installed = results[0].action.as_ref().expect("action result");
    assert!(installed.successful);
    assert!(installed.restart_required);
    assert!(!installed.restarted);
    assert!(results[1].notes[0].contains("not attempted"));
    assert_eq!(outcomes(&report, "sql02"), vec![Outcome::Succeeded]);
}

#[tokio::test]
async fn restart_required_without_automatic_restart_stops_the_host() {
    let harness = Harness::new(MockConfig {
        exit_codes: HashMap::from([(("sql01".to_string(), 5000642), 3010)]),
        ..MockConfig::default()
    });

    let (report, _) = harness
        .run(vec![planned("sql01", &[5000642, 5001090], false)])
        .await;

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Succeeded, Outcome::Skipped]
    );
    let first = report.host("sql01")[0]
        .action
        .as_ref()
        .expect("action result");
    assert!(first.restart_required);
    assert!(!first.restarted);
    assert!(report.host("sql01")[1].notes[0].contains("automatic restart is disabled"));
    assert!(!report.has_failures());
    assert_eq!(harness.backend.count("restart"), 0);
}

#[tokio::test]
async fn restart_after_install_renegotiates_the_channel() {
    let mut harness = Harness::new(MockConfig {
        exit_codes: HashMap::from([(("sql01".to_string(), 5000642), 3010)]),
        ..MockConfig::default()
    });
    harness.options.restart = true;

    let (report, _) = harness
        .run(vec![planned("sql01", &[5000642, 5001090], false)])
        .await;

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Succeeded, Outcome::Succeeded]
    );
    let first = report.host("sql01")[0]
        .action
        .as_ref()
        .expect("action result");
    assert!(first.restarted);
    assert_eq!(harness.backend.count("restart sql01"), 1);
    assert_eq!(harness.backend.count("connect sql01"), 2);
}

#[tokio::test]
async fn pending_reboot_blocks_host_when_restart_is_disabled() {
    let harness = Harness::new(MockConfig {
        pending_reboot: HashSet::from(["sql01".to_string()]),
        ..MockConfig::default()
    });

    let (report, _) = harness
        .run(vec![planned("sql01", &[5000642, 5001090], false)])
        .await;

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Failed, Outcome::Skipped]
    );
    assert_eq!(
        report.host("sql01")[0].error,
        Some(ErrorKind::PendingReboot)
    );
    assert_eq!(harness.backend.count("install"), 0);
}

#[tokio::test]
async fn continue_run_tolerates_pending_reboot_on_first_action_only() {
    let harness = Harness::new(MockConfig {
        pending_reboot: HashSet::from(["sql01".to_string()]),
        ..MockConfig::default()
    });

    let (report, _) = harness
        .run(vec![planned("sql01", &[5000642, 5001090], true)])
        .await;

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Succeeded, Outcome::Failed]
    );
    assert!(report.host("sql01")[0].notes[0].contains("reboot pending"));
    assert_eq!(
        report.host("sql01")[1].error,
        Some(ErrorKind::PendingReboot)
    );
}

#[tokio::test]
async fn pending_reboot_is_cleared_by_restart_when_enabled() {
    let mut harness = Harness::new(MockConfig {
        pending_reboot: HashSet::from(["sql01".to_string()]),
        ..MockConfig::default()
    });
    harness.options.restart = true;

    let (report, _) = harness.run(vec![planned("sql01", &[5000642], false)]).await;

    assert_eq!(outcomes(&report, "sql01"), vec![Outcome::Succeeded]);
    let calls = harness.backend.calls();
    let restart = calls
        .iter()
        .position(|call| call == "restart sql01")
        .expect("restart must happen");
    let install = calls
        .iter()
        .position(|call| call.starts_with("install sql01"))
        .expect("install must happen");
    assert!(restart < install);
}

#[tokio::test]
async fn credssp_is_configured_once_per_host_and_fallback_is_used() {
    let mut harness = Harness::new(MockConfig {
        rejected: HashMap::from([(
            "sql01".to_string(),
            HashSet::from([AuthProtocol::Credssp]),
        )]),
        exit_codes: HashMap::from([(("sql01".to_string(), 5000642), 3010)]),
        ..MockConfig::default()
    });
    harness.primary = AuthProtocol::Credssp;
    harness.fallback = Some(AuthProtocol::Negotiate);
    harness.approver = Arc::new(AlwaysApprove);
    harness.options.restart = true;

    let (report, _) = harness
        .run(vec![planned("sql01", &[5000642, 5001090], false)])
        .await;

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Succeeded, Outcome::Succeeded]
    );
    // The restart forces a second negotiation; CredSSP is not reconfigured.
    assert_eq!(harness.backend.count("credssp sql01"), 1);
    assert_eq!(harness.backend.count("connect sql01 Negotiate"), 2);
    assert!(report.host("sql01")[0]
        .notes
        .iter()
        .any(|note| note.contains("fallback protocol Negotiate")));
}

#[tokio::test]
async fn credssp_configuration_lets_primary_protocol_succeed() {
    let mut harness = Harness::new(MockConfig {
        rejected: HashMap::from([(
            "sql01".to_string(),
            HashSet::from([AuthProtocol::Credssp]),
        )]),
        credssp_fixes: HashSet::from(["sql01".to_string()]),
        ..MockConfig::default()
    });
    harness.primary = AuthProtocol::Credssp;

    let (report, _) = harness.run(vec![planned("sql01", &[5000642], false)]).await;

    assert_eq!(outcomes(&report, "sql01"), vec![Outcome::Succeeded]);
    assert_eq!(harness.backend.count("connect sql01 Credssp"), 2);
    assert_eq!(harness.backend.count("credssp sql01"), 1);
}

#[tokio::test]
async fn declined_fallback_fails_only_that_host() {
    let mut harness = Harness::new(MockConfig {
        rejected: HashMap::from([(
            "sql01".to_string(),
            HashSet::from([AuthProtocol::Kerberos]),
        )]),
        ..MockConfig::default()
    });
    harness.primary = AuthProtocol::Kerberos;
    harness.fallback = Some(AuthProtocol::Basic);

    let (report, _) = harness
        .run(vec![
            planned("sql01", &[5000642, 5001090], false),
            planned("sql02", &[5000642], false),
        ])
        .await;

    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::Failed, Outcome::Skipped]
    );
    assert_eq!(report.host("sql01")[0].error, Some(ErrorKind::Auth));
    assert_eq!(outcomes(&report, "sql02"), vec![Outcome::Succeeded]);
    assert_eq!(harness.backend.count("connect sql01 Basic"), 0);
    assert_eq!(report.failed_hosts(), vec!["sql01"]);
}

#[tokio::test]
async fn planning_and_install_failures_stay_scoped_to_their_hosts() {
    let harness = Harness::new(MockConfig {
        exit_codes: HashMap::from([(("sql03".to_string(), 5000642), 1603)]),
        ..MockConfig::default()
    });

    let (report, streamed) = harness
        .run(vec![
            PlannedHost::failed(
                "sql01",
                PatchError::Planning("no known builds for release family 99.0".to_string()),
            ),
            planned("sql02", &[5000642, 5001090], false),
            planned("sql03", &[5000642, 5001090], false),
        ])
        .await;

    let sql01 = report.host("sql01");
    assert_eq!(sql01.len(), 1);
    assert!(sql01[0].action.is_none());
    assert_eq!(sql01[0].error, Some(ErrorKind::Planning));

    assert_eq!(
        outcomes(&report, "sql02"),
        vec![Outcome::Succeeded, Outcome::Succeeded]
    );
    assert_eq!(
        outcomes(&report, "sql03"),
        vec![Outcome::Failed, Outcome::Skipped]
    );
    assert_eq!(report.host("sql03")[0].error, Some(ErrorKind::Install));
    assert!(report.host("sql03")[0]
        .notes
        .iter()
        .any(|note| note.contains("1603")));

    assert_eq!(streamed.len(), report.results().count());
    let sql02_kbs = streamed
        .iter()
        .filter(|result| result.computer_name == "sql02")
        .filter_map(|result| result.action.as_ref().map(|action| action.kb))
        .collect::<Vec<_>>();
    assert_eq!(sql02_kbs, vec![5000642, 5001090]);
}

#[tokio::test]
async fn dry_run_never_touches_the_backend() {
    let mut harness = Harness::new(MockConfig {
        pending_reboot: HashSet::from(["sql01".to_string()]),
        ..MockConfig::default()
    });
    harness.options.dry_run = true;

    let (report, streamed) = harness
        .run(vec![
            planned("sql01", &[5000642, 5001090], false),
            planned("sql02", &[], false),
        ])
        .await;

    assert!(harness.backend.calls().is_empty());
    assert_eq!(
        outcomes(&report, "sql01"),
        vec![Outcome::DryRun, Outcome::DryRun]
    );
    assert_eq!(outcomes(&report, "sql02"), vec![Outcome::UpToDate]);
    assert_eq!(streamed.len(), 3);
}

#[tokio::test]
async fn unc_media_is_used_in_place_and_local_media_is_copied() {
    let harness = Harness::new(MockConfig::default());
    let mut unc = action(5000642);
    unc.installer = InstallerPath::Local(PathBuf::from(r"\\fileserver\media\KB5000642-x64.exe"));
    let mut plan = ComputerPlan::new("sql01", false);
    plan.actions = vec![unc, action(5001090)];

    let (report, _) = harness.run(vec![PlannedHost::planned(plan)]).await;

    assert!(!report.has_failures());
    let calls = harness.backend.calls();
    assert_eq!(harness.backend.count("copy sql01"), 1);
    assert!(calls
        .iter()
        .any(|call| call == r"install sql01 \\fileserver\media\KB5000642-x64.exe"));
    assert!(calls.iter().any(|call| call
        == &format!(r"install sql01 {DEFAULT_REMOTE_MEDIA_DIR}\KB5001090-x64.exe")));
}

#[tokio::test]
async fn plan_fleet_isolates_inventory_failures_and_keeps_host_order() {
    let backend = MockBackend::new(MockConfig {
        inventories: HashMap::from([(
            "sql02".to_string(),
            vec![Component {
                computer_name: "sql02".to_string(),
                instance_name: "MSSQLSERVER".to_string(),
                major_version: 15,
                architecture: Architecture::X64,
                current_version: BuildVersion::new(15, 0, 2000, Some(5)),
            }],
        )]),
        ..MockConfig::default()
    });
    let mut rtm = BuildRecord::new(BuildVersion::new(15, 0, 2000, Some(5)));
    rtm.release_name = Some("2019".to_string());
    let mut cu1 = BuildRecord::new(BuildVersion::new(15, 0, 4003, Some(23)));
    cu1.cumulative_update = Some("CU1".to_string());
    cu1.kb_list = vec![4527376];
    let table = Arc::new(BuildTable::new(vec![rtm, cu1]).expect("table must build"));
    let request = Arc::new(PlanRequest {
        specs: vec![VersionSpec::parse("2019CU1").expect("spec must parse")],
        continue_run: false,
    });

    let hosts = ["sql01", "sql02", "SQL02", " "]
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let fleet = plan_fleet(
        Arc::new(backend.clone()),
        &Credential::current_user(),
        table,
        request,
        &hosts,
        1,
    )
    .await;

    assert_eq!(fleet.len(), 2);
    assert_eq!(fleet[0].computer_name, "sql01");
    assert_eq!(
        fleet[0].plan.as_ref().expect_err("sql01 must fail").kind(),
        ErrorKind::Connection
    );
    assert_eq!(fleet[1].computer_name, "sql02");
    assert_eq!(fleet[1].actions().len(), 1);
    assert_eq!(fleet[1].actions()[0].kb, 4527376);
    assert_eq!(backend.count("inventory"), 2);
}

#[test]
fn gate_decisions_cover_every_combination() {
    use crate::gate::decide;

    assert_eq!(decide(false, false, false), Some(GateDecision::Proceed));
    assert_eq!(decide(false, true, true), Some(GateDecision::Proceed));
    assert_eq!(decide(true, true, false), Some(GateDecision::RestartFirst));
    assert_eq!(
        decide(true, false, true),
        Some(GateDecision::ProceedDespitePending)
    );
    assert_eq!(decide(true, false, false), None);
}

#[test]
fn installer_exit_codes_map_to_outcomes() {
    let update = action(5000642);
    let output = |exit_code| CommandOutput {
        exit_code,
        stdout: "setup log written".to_string(),
        stderr: String::new(),
    };

    assert_eq!(
        interpret_exit(&update, &output(0)).expect("0 is success"),
        InstallOutcome::Completed
    );
    assert_eq!(
        interpret_exit(&update, &output(3010)).expect("3010 is success"),
        InstallOutcome::RestartRequired
    );
    let err = interpret_exit(&update, &output(1603)).expect_err("1603 is failure");
    assert_eq!(err.kind(), ErrorKind::Install);
    assert!(err.to_string().contains("setup log written"));

    let command = installer_command(r"C:\Temp\KB5000642-x64.exe");
    assert_eq!(
        command.command_line(),
        r#""C:\Temp\KB5000642-x64.exe" /quiet /allinstances /IAcceptSQLServerLicenseTerms"#
    );
    assert!(is_unc_path(Path::new(r"\\fs01\media\KB1.exe")));
    assert!(!is_unc_path(Path::new(r"C:\media\KB1.exe")));
}

#[test]
fn command_templates_substitute_placeholders_once() {
    let vars = BTreeMap::from([
        ("host", "sql01".to_string()),
        ("command", "\"C:\\KB1.exe\" /quiet {host}".to_string()),
    ]);
    let argv = scripted::render_template(
        "pwsh -File run.ps1 -ComputerName {host} -Command {command} -Extra {unknown}",
        &vars,
    );
    assert_eq!(
        argv,
        vec![
            "pwsh",
            "-File",
            "run.ps1",
            "-ComputerName",
            "sql01",
            "-Command",
            "\"C:\\KB1.exe\" /quiet {host}",
            "-Extra",
            "{unknown}",
        ]
    );
}

#[test]
fn auth_protocol_parses_case_insensitively() {
    assert_eq!(AuthProtocol::parse("credSSP"), Some(AuthProtocol::Credssp));
    assert_eq!("negotiate".parse::<AuthProtocol>(), Ok(AuthProtocol::Negotiate));
    assert!("ntlm".parse::<AuthProtocol>().is_err());
    let credential = Credential::new("dba", Some("hunter2".to_string()));
    assert!(!format!("{credential:?}").contains("hunter2"));
}

#[cfg(unix)]
#[tokio::test]
async fn scripted_backend_runs_templates_without_a_shell() {
    let backend = ScriptedBackend::new(CommandTemplates {
        inventory: Some(
            r#"echo [{"ComputerName":"{host}","InstanceName":"MSSQLSERVER","MajorVersion":15,"Architecture":"x64","CurrentVersion":"15.0.2000.5"}]"#
                .to_string(),
        ),
        pending_reboot: Some("echo false".to_string()),
        connect: Some("false".to_string()),
        ..CommandTemplates::default()
    });
    let credential = Credential::current_user();

    let components = backend
        .collect_components("sql01", &credential)
        .await
        .expect("inventory must parse");
    assert_eq!(components.len(), 1);
    assert_eq!(components[0].computer_name, "sql01");
    assert_eq!(
        components[0].current_version,
        BuildVersion::new(15, 0, 2000, Some(5))
    );

    assert!(!backend
        .pending_reboot("sql01", &credential)
        .await
        .expect("pending reboot must parse"));

    let err = backend
        .connect("sql01", &credential, AuthProtocol::Kerberos)
        .await
        .err()
        .expect("failing connect probe must be an auth error");
    assert_eq!(err.kind(), ErrorKind::Auth);

    let err = backend
        .restart("sql01", &credential)
        .await
        .expect_err("missing template must fail");
    assert_eq!(err.kind(), ErrorKind::Restart);
    assert!(err.to_string().contains("no [backend] restart command"));
}
