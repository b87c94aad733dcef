use super::*;
use patchfleet_core::{
    Architecture, BuildRecord, BuildTable, BuildVersion, Component, ComputerPlan, ErrorKind,
    InstallerPath, PatchError, PlannedHost,
};
use patchfleet_resolver::Policy;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn version(input: &str) -> BuildVersion {
    BuildVersion::parse(input).expect("valid version")
}

fn record(
    raw: &str,
    name: Option<&str>,
    sp: Option<&str>,
    cu: Option<&str>,
    kb: Option<u32>,
) -> BuildRecord {
    let mut record = BuildRecord::new(version(raw));
    record.release_name = name.map(str::to_string);
    record.service_pack = sp.map(str::to_string);
    record.cumulative_update = cu.map(str::to_string);
    record.kb_list = kb.into_iter().collect();
    record
}

fn reference_table() -> BuildTable {
    BuildTable::new(vec![
        record("13.0.1601.5", Some("2016"), Some("RTM"), None, None),
        record("13.0.2149.0", None, None, Some("CU1"), Some(3164674)),
        record("13.0.4001.0", None, Some("SP1"), None, Some(3182545)),
        record("13.0.4411.0", None, None, Some("CU1"), Some(3208177)),
        record("13.0.4422.0", None, None, Some("CU2"), Some(4013106)),
        record("13.0.5026.0", None, Some("SP2"), None, Some(4052908)),
        record("13.0.5149.0", None, None, Some("CU1"), Some(4135048)),
        record("13.0.5153.0", None, None, Some("CU2"), Some(4340355)),
        record("15.0.2000.5", Some("2019"), Some("RTM"), None, None),
        record("15.0.4003.23", None, None, Some("CU1"), Some(4527376)),
        record("15.0.4013.40", None, None, Some("CU2"), Some(4536075)),
    ])
    .expect("reference table must build")
}

fn component(instance: &str, current: &str, architecture: Architecture) -> Component {
    let current_version = version(current);
    Component {
        computer_name: "sql01".to_string(),
        instance_name: instance.to_string(),
        major_version: current_version.major,
        architecture,
        current_version,
    }
}

fn specs(inputs: &[&str]) -> Vec<VersionSpec> {
    inputs
        .iter()
        .map(|input| VersionSpec::parse(input).expect("spec must parse"))
        .collect()
}

fn plan_for(components: &[Component], inputs: &[&str]) -> Result<ComputerPlan, PatchError> {
    plan_host(&reference_table(), "sql01", components, &specs(inputs), false)
}

#[test]
fn version_spec_parses_every_supported_shape() {
    assert_eq!(
        VersionSpec::parse("2019SP1CU5").expect("must parse"),
        VersionSpec::Level {
            family: Some("2019".to_string()),
            service_pack: Some("SP1".to_string()),
            cumulative_update: Some("CU5".to_string()),
        }
    );
    assert_eq!(
        VersionSpec::parse("sp2").expect("must parse"),
        VersionSpec::Level {
            family: None,
            service_pack: Some("SP2".to_string()),
            cumulative_update: None,
        }
    );
    assert_eq!(
        VersionSpec::parse("15.0 CU2").expect("must parse"),
        VersionSpec::Level {
            family: Some("15.0".to_string()),
            service_pack: None,
            cumulative_update: Some("CU2".to_string()),
        }
    );
    assert_eq!(
        VersionSpec::parse("2016Latest").expect("must parse"),
        VersionSpec::Latest {
            family: Some("2016".to_string()),
        }
    );
    assert_eq!(
        VersionSpec::parse("latest").expect("must parse"),
        VersionSpec::Latest { family: None }
    );
    assert_eq!(
        VersionSpec::parse("KB4548597").expect("must parse"),
        VersionSpec::Kb(4548597)
    );
    assert_eq!(
        VersionSpec::parse("4548597").expect("must parse"),
        VersionSpec::Kb(4548597)
    );
    assert_eq!(
        VersionSpec::parse("15.0.4033.1").expect("must parse"),
        VersionSpec::Build(version("15.0.4033.1"))
    );
    assert_eq!(
        VersionSpec::parse("2019sp1cu5").expect("must parse").to_string(),
        "2019SP1CU5"
    );
}

#[test]
fn version_spec_rejects_malformed_input() {
    for input in [
        "", "2019", "SP", "2019SPX", "15.0", "CU5SP1", "KBabc", "Newest", "R2SP1",
    ] {
        assert!(
            VersionSpec::parse(input).is_err(),
            "'{input}' should be rejected"
        );
    }
}

#[test]
fn planning_is_idempotent_at_target() {
    let components = [component("MSSQLSERVER", "13.0.5153.0", Architecture::X64)];
    let plan = plan_for(
        &components,
        &["Latest", "13.0.5153.0", "KB4340355", "SP2CU2", "SP1"],
    )
    .expect("plan must succeed");
    assert!(plan.actions.is_empty());
}

#[test]
fn service_pack_then_cumulative_update_chain_uses_simulated_baseline() {
    let components = [component("MSSQLSERVER", "13.0.1601.5", Architecture::X64)];
    let plan = plan_for(&components, &["SP1", "SP1CU2"]).expect("plan must succeed");

    assert_eq!(plan.actions.len(), 2);
    assert_eq!(plan.actions[0].kb, 3182545);
    assert_eq!(plan.actions[0].target_version, version("13.0.4001.0"));
    assert_eq!(plan.actions[0].level_label(), "SP1");
    assert_eq!(plan.actions[1].kb, 4013106);
    assert_eq!(plan.actions[1].level_label(), "SP1CU2");

    // A CU without an SP applies to the SP reached by the previous action,
    // not to the RTM the host started from.
    let plan = plan_for(&components, &["SP2", "CU1"]).expect("plan must succeed");
    assert_eq!(plan.actions.len(), 2);
    assert_eq!(plan.actions[1].target_version, version("13.0.5149.0"));
    assert_eq!(plan.actions[1].level_label(), "SP2CU1");
}

#[test]
fn later_spec_below_simulated_baseline_is_skipped() {
    let components = [component("MSSQLSERVER", "13.0.1601.5", Architecture::X64)];
    let plan = plan_for(&components, &["SP1CU2", "SP1"]).expect("plan must succeed");
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].kb, 4013106);
}

#[test]
fn latest_expands_to_service_pack_then_newest_build() {
    let components = [component("MSSQLSERVER", "13.0.4422.0", Architecture::X64)];
    let plan = plan_for(&components, &["Latest"]).expect("plan must succeed");

    let kbs = plan.actions.iter().map(|action| action.kb).collect::<Vec<_>>();
    assert_eq!(kbs, vec![4052908, 4340355]);
}

#[test]
fn max_behind_policy_plans_single_action_from_cu3() {
    let table = BuildTable::new(vec![
        record("1.0.100", Some("one"), Some("RTM"), None, None),
        record("1.0.200", None, Some("SP1"), None, Some(1000001)),
        record("1.0.300", None, None, Some("CU3"), Some(1000003)),
        record("1.0.400", None, None, Some("CU7"), Some(1000007)),
    ])
    .expect("table must build");
    let components = [component("MSSQLSERVER", "1.0.300", Architecture::X64)];
    let policy = VersionSpec::Policy(Policy::MaxBehind {
        sp_behind: None,
        cu_behind: Some(0),
    });

    let plan = plan_host(&table, "sql01", &components, &[policy], false)
        .expect("plan must succeed");
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].level_label(), "SP1CU7");
    assert_eq!(plan.actions[0].kb_label(), "KB1000007");
}

#[test]
fn max_behind_policy_targets_each_family_on_one_host() {
    let components = [
        component("LEGACY", "13.0.4422.0", Architecture::X64),
        component("MSSQLSERVER", "15.0.4003.23", Architecture::X64),
    ];
    let policy = VersionSpec::Policy(Policy::MaxBehind {
        sp_behind: Some(0),
        cu_behind: Some(0),
    });

    let plan = plan_host(&reference_table(), "sql01", &components, &[policy], false)
        .expect("plan must succeed");
    let targets = plan
        .actions
        .iter()
        .map(|action| (action.family.major, action.kb, action.level_label()))
        .collect::<Vec<_>>();
    assert_eq!(
        targets,
        vec![
            (13, 4340355, "SP2CU2".to_string()),
            (15, 4536075, "RTMCU2".to_string()),
        ]
    );

    // Once compliant, the same policy plans nothing.
    let patched = [
        component("LEGACY", "13.0.5153.0", Architecture::X64),
        component("MSSQLSERVER", "15.0.4013.40", Architecture::X64),
    ];
    let policy = VersionSpec::Policy(Policy::MaxBehind {
        sp_behind: Some(0),
        cu_behind: Some(0),
    });
    let plan = plan_host(&reference_table(), "sql01", &patched, &[policy], false)
        .expect("plan must succeed");
    assert!(plan.actions.is_empty());
}

#[test]
fn minimum_build_policy_only_binds_its_family() {
    let components = [
        component("LEGACY", "13.0.4411.0", Architecture::X64),
        component("MSSQLSERVER", "15.0.2000.5", Architecture::X64),
    ];
    let policy = VersionSpec::Policy(Policy::MinimumBuild(version("13.0.4430.0")));

    let plan = plan_host(
        &reference_table(),
        "sql01",
        &components,
        std::slice::from_ref(&policy),
        false,
    )
    .expect("plan must succeed");
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].kb, 4052908);
    assert_eq!(plan.actions[0].target_version, version("13.0.5026.0"));

    let compliant = [component("LEGACY", "13.0.5026.0", Architecture::X64)];
    let plan = plan_host(&reference_table(), "sql01", &compliant, &[policy], false)
        .expect("plan must succeed");
    assert!(plan.actions.is_empty());
}

#[test]
fn release_names_with_letters_select_their_family() {
    assert_eq!(
        VersionSpec::parse("2008R2SP2").expect("must parse"),
        VersionSpec::Level {
            family: Some("2008R2".to_string()),
            service_pack: Some("SP2".to_string()),
            cumulative_update: None,
        }
    );
    assert_eq!(
        VersionSpec::parse("2008r2 latest").expect("must parse"),
        VersionSpec::Latest {
            family: Some("2008R2".to_string()),
        }
    );

    let table = BuildTable::new(vec![
        record("10.50.1600.1", Some("2008R2"), Some("RTM"), None, None),
        record("10.50.2500.0", None, Some("SP1"), None, Some(2528583)),
        record("10.50.4000.0", None, Some("SP2"), None, Some(2630458)),
        record("13.0.1601.5", Some("2016"), Some("RTM"), None, None),
        record("13.0.4001.0", None, Some("SP1"), None, Some(3182545)),
    ])
    .expect("table must build");
    let components = [
        component("LEGACY", "10.50.1600.1", Architecture::X64),
        component("MSSQLSERVER", "13.0.1601.5", Architecture::X64),
    ];

    let plan = plan_host(&table, "sql01", &components, &specs(&["2008R2SP2"]), false)
        .expect("plan must succeed");
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].kb, 2630458);
    assert_eq!(plan.actions[0].family.minor, 50);
}

#[test]
fn instances_of_one_family_and_architecture_share_an_action() {
    let components = [
        component("MSSQLSERVER", "13.0.4411.0", Architecture::X64),
        component("REPORTING", "13.0.4001.0", Architecture::X64),
        component("LEGACY32", "13.0.4001.0", Architecture::X86),
        component("NEWER", "15.0.2000.5", Architecture::X64),
    ];
    let plan = plan_for(&components, &["2016SP1CU1"]).expect("plan must succeed");

    assert_eq!(plan.actions.len(), 2);
    let x64 = plan
        .actions
        .iter()
        .find(|action| action.architecture == Architecture::X64)
        .expect("x64 action");
    assert_eq!(x64.instances, vec!["MSSQLSERVER", "REPORTING"]);
    assert!(plan
        .actions
        .iter()
        .all(|action| action.family.major == 13 && action.installer == InstallerPath::Unresolved));
}

#[test]
fn build_and_kb_specs_only_touch_their_family() {
    let components = [
        component("MSSQLSERVER", "13.0.4001.0", Architecture::X64),
        component("NEWER", "15.0.2000.5", Architecture::X64),
    ];
    let plan = plan_for(&components, &["KB4536075", "13.0.4422.0"]).expect("plan must succeed");

    assert_eq!(plan.actions.len(), 2);
    assert_eq!(plan.actions[0].family.major, 15);
    assert_eq!(plan.actions[0].kb, 4536075);
    assert_eq!(plan.actions[1].family.major, 13);
    assert_eq!(plan.actions[1].kb, 4013106);
}

#[test]
fn unresolvable_specs_fail_the_host() {
    let unknown_family = [component("MSSQLSERVER", "99.0.100.0", Architecture::X64)];
    let err = plan_for(&unknown_family, &["Latest"]).expect_err("unknown family must fail");
    assert_eq!(err.kind(), ErrorKind::Planning);

    let ahead = [component("MSSQLSERVER", "15.0.9999.0", Architecture::X64)];
    let err = plan_for(&ahead, &["CU2"]).expect_err("build past reference must fail");
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert!(err.to_string().contains("newer than every known build"));

    let older = [component("MSSQLSERVER", "13.0.1000.0", Architecture::X64)];
    let err = plan_for(&older, &["SP1"]).expect_err("build before reference must fail");
    assert_eq!(err.kind(), ErrorKind::Planning);

    let rtm = [component("MSSQLSERVER", "13.0.1601.5", Architecture::X64)];
    let err = plan_for(&rtm, &["13.0.4000.0"]).expect_err("unknown exact build must fail");
    assert!(err.to_string().contains("not listed"));

    let err = plan_for(&rtm, &["2031SP1"]).expect_err("unknown release must fail");
    assert!(err.to_string().contains("2031"));
}

#[test]
fn inventory_failure_isolated_to_its_host() {
    let table = reference_table();
    let wanted = specs(&["SP2"]);
    let failed = plan_inventory(
        &table,
        "sql-a",
        Err(PatchError::Connection("sql-a: WinRM unreachable".to_string())),
        &wanted,
        false,
    );
    let planned = plan_inventory(
        &table,
        "sql-b",
        Ok(vec![component("MSSQLSERVER", "13.0.4001.0", Architecture::X64)]),
        &wanted,
        false,
    );

    assert_eq!(
        failed.plan.as_ref().expect_err("host a must fail").kind(),
        ErrorKind::Connection
    );
    assert!(failed.actions().is_empty());
    assert_eq!(planned.actions().len(), 1);
}

#[test]
fn media_index_matches_kb_and_architecture_tokens() {
    let index = MediaIndex::from_paths(vec![
        PathBuf::from("/media/SQLServer2016-KB40529081-x64.exe"),
        PathBuf::from("/media/SQLServer2016-KB4052908-x86.exe"),
        PathBuf::from("/media/sp2/SQLServer2016SP2-KB4052908-x64-ENU.exe"),
    ]);

    assert_eq!(
        index.find(4052908, Architecture::X64),
        Some(Path::new("/media/sp2/SQLServer2016SP2-KB4052908-x64-ENU.exe"))
    );
    assert_eq!(
        index.find(4052908, Architecture::X86),
        Some(Path::new("/media/SQLServer2016-KB4052908-x86.exe"))
    );
    assert_eq!(index.find(405290, Architecture::X64), None);
}

#[test]
fn media_index_scans_repositories_recursively() {
    let root = test_root();
    let nested = root.join("2016").join("sp2");
    fs::create_dir_all(&nested).expect("must create media dirs");
    fs::write(nested.join("SQLServer2016SP2-KB4052908-x64-ENU.exe"), b"mz")
        .expect("must write installer");
    fs::write(root.join("KB4052908-x64.txt"), b"notes").expect("must write notes");

    let index = MediaIndex::scan(std::slice::from_ref(&root));
    assert_eq!(index.len(), 1);
    assert!(index.find(4052908, Architecture::X64).is_some());
    assert!(index.unreadable().is_empty());

    let missing = root.join("missing");
    let index = MediaIndex::scan(&[missing.clone(), root.clone()]);
    assert_eq!(index.len(), 1);
    assert_eq!(index.unreadable(), &[missing]);

    let _ = fs::remove_dir_all(&root);
}

fn planned_hosts() -> Vec<PlannedHost> {
    let table = reference_table();
    let wanted = specs(&["SP2", "SP2CU2"]);
    ["sql-a", "sql-b"]
        .into_iter()
        .map(|host| {
            plan_inventory(
                &table,
                host,
                Ok(vec![component("MSSQLSERVER", "13.0.4001.0", Architecture::X64)]),
                &wanted,
                false,
            )
        })
        .collect()
}

#[test]
fn missing_media_fails_host_when_downloads_are_disabled() {
    let mut hosts = planned_hosts();
    let index = MediaIndex::from_paths(vec![PathBuf::from("/media/KB4052908-x64.exe")]);

    let queue = resolve_installers(&mut hosts, &index, false);
    assert!(queue.is_empty());
    for host in &hosts {
        let err = host.plan.as_ref().expect_err("host must fail");
        assert_eq!(err.kind(), ErrorKind::Planning);
        assert!(err.to_string().contains("KB4340355"));
    }
}

#[test]
fn missing_media_is_queued_once_per_kb_and_architecture() {
    let mut hosts = planned_hosts();
    let index = MediaIndex::from_paths(vec![PathBuf::from("/media/KB4052908-x64.exe")]);

    let queue = resolve_installers(&mut hosts, &index, true);
    assert_eq!(queue.len(), 1);
    assert_eq!(
        queue.iter().next(),
        Some(&DownloadRequest {
            kb: 4340355,
            architecture: Architecture::X64,
        })
    );
    for host in &hosts {
        let actions = host.actions();
        assert_eq!(
            actions[0].installer,
            InstallerPath::Local(PathBuf::from("/media/KB4052908-x64.exe"))
        );
        assert_eq!(actions[1].installer, InstallerPath::PendingDownload);
    }
}

struct RecordingDownloader {
    calls: RefCell<Vec<u32>>,
    failing_kb: Option<u32>,
}

impl UpdateDownloader for RecordingDownloader {
    fn download(
        &self,
        kb: u32,
        architecture: Architecture,
        destination_dir: &Path,
    ) -> Result<PathBuf, PatchError> {
        self.calls.borrow_mut().push(kb);
        if self.failing_kb == Some(kb) {
            return Err(PatchError::Download(format!("KB{kb}: HTTP 404")));
        }
        Ok(destination_dir.join(DownloadRequest { kb, architecture }.file_name()))
    }
}

#[test]
fn downloads_are_fetched_once_and_shared_by_hosts() {
    let mut hosts = planned_hosts();
    let queue = resolve_installers(&mut hosts, &MediaIndex::default(), true);
    assert_eq!(queue.len(), 2);

    let downloader = RecordingDownloader {
        calls: RefCell::new(Vec::new()),
        failing_kb: None,
    };
    let summary = apply_downloads(&mut hosts, &queue, &downloader, Path::new("/cache"));

    assert_eq!(downloader.calls.borrow().len(), 2);
    assert!(summary.failed.is_empty());
    for host in &hosts {
        for action in host.actions() {
            let path = action.installer.local().expect("installer must be local");
            assert!(path.starts_with("/cache"));
        }
    }
}

#[test]
fn failed_download_fails_only_hosts_that_need_it() {
    let table = reference_table();
    let mut hosts = vec![
        plan_inventory(
            &table,
            "needs-sp2",
            Ok(vec![component("MSSQLSERVER", "13.0.4001.0", Architecture::X64)]),
            &specs(&["SP2"]),
            false,
        ),
        plan_inventory(
            &table,
            "needs-2019-cu2",
            Ok(vec![component("MSSQLSERVER", "15.0.2000.5", Architecture::X64)]),
            &specs(&["2019CU2"]),
            false,
        ),
    ];
    let queue = resolve_installers(&mut hosts, &MediaIndex::default(), true);
    let downloader = RecordingDownloader {
        calls: RefCell::new(Vec::new()),
        failing_kb: Some(4052908),
    };

    let summary = apply_downloads(&mut hosts, &queue, &downloader, Path::new("/cache"));
    assert_eq!(summary.failed.len(), 1);

    let err = hosts[0].plan.as_ref().expect_err("sp2 host must fail");
    assert_eq!(err.kind(), ErrorKind::Download);
    assert!(hosts[1].plan.is_ok());
    assert!(hosts[1].actions()[0].installer.local().is_some());
}

#[test]
fn pending_downloads_fail_only_hosts_without_local_media() {
    let table = reference_table();
    let mut hosts = vec![
        plan_inventory(
            &table,
            "local-media",
            Ok(vec![component("MSSQLSERVER", "13.0.4001.0", Architecture::X64)]),
            &specs(&["SP2"]),
            false,
        ),
        plan_inventory(
            &table,
            "needs-download",
            Ok(vec![component("MSSQLSERVER", "15.0.2000.5", Architecture::X64)]),
            &specs(&["2019CU2"]),
            false,
        ),
    ];
    let index = MediaIndex::from_paths(vec![PathBuf::from("/media/KB4052908-x64.exe")]);
    let queue = resolve_installers(&mut hosts, &index, true);
    assert_eq!(queue.len(), 1);

    let failed = fail_pending_downloads(
        &mut hosts,
        &PatchError::Download("no download source configured".to_string()),
    );
    assert_eq!(failed, 1);
    assert!(hosts[0].actions()[0].installer.local().is_some());
    let err = hosts[1].plan.as_ref().expect_err("pending host must fail");
    assert_eq!(err.kind(), ErrorKind::Download);
}

#[test]
fn http_downloader_expands_template_and_reuses_existing_file() {
    let downloader = HttpDownloader::new("https://media.example.test/{kb}/sql-{arch}.exe");
    assert_eq!(
        downloader.url_for(4052908, Architecture::X86),
        "https://media.example.test/4052908/sql-x86.exe"
    );

    let root = test_root();
    fs::create_dir_all(&root).expect("must create root");
    let existing = root.join(
        DownloadRequest {
            kb: 4052908,
            architecture: Architecture::X64,
        }
        .file_name(),
    );
    fs::write(&existing, b"mz").expect("must seed installer");

    let path = downloader
        .download(4052908, Architecture::X64, &root)
        .expect("existing installer must be reused");
    assert_eq!(path, existing);

    let _ = fs::remove_dir_all(&root);
}

fn test_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "patchfleet-planner-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}
