use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::bus::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::gate::*;
use crate::ledger::*;
use crate::pr::*;
use crate::qa::*;
use crate::report::*;
use crate::status::*;
use crate::supervisor::*;
use crate::telemetry::*;
use crate::vcs::*;
use crate::worker::*;

use tempfile::{TempDir, tempdir};

fn feature(root: &Path, name: &str) -> Feature {
    Feature {
        name: name.to_string(),
        branch: format!("feature/{name}"),
        directory: root.join("worktrees").join(name),
        status_log: root.join("status").join(format!("{name}.log")),
    }
}

fn base_cfg(root: &Path, features: &[&str]) -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".foreman/config.toml".to_string(),
        root: root.to_path_buf(),
        repo_dir: root.to_path_buf(),
        trunk: "main".to_string(),
        poll_interval: Duration::from_millis(20),
        max_cycles: 3,
        delivery_mode: DeliveryMode::Push,
        qa_agent: "qa".to_string(),
        features: features.iter().map(|name| feature(root, name)).collect(),
        ownership: BTreeMap::new(),
        standards_catalog: None,
        build: BuildSettings {
            install: None,
            check: None,
            start: None,
            smoke_grace: Duration::from_millis(200),
            command_timeout: Duration::from_secs(30),
        },
        build_failure_routing: BuildFailureRouting::LastMerged,
        pull_request: PullRequestSettings {
            enabled: true,
            remote: "origin".to_string(),
            base: None,
            draft: false,
            supported_hosts: vec!["github.com".to_string()],
        },
        telemetry_enabled: false,
        telemetry_path: root.join("telemetry.jsonl").display().to_string(),
    }
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        root: None,
        repo_dir: None,
        trunk: None,
        poll_interval_secs: None,
        max_cycles: None,
        delivery_mode: None,
        qa_agent: None,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: Commands::Doctor,
    }
}

fn passing(id: &str) -> StandardResult {
    StandardResult {
        id: id.to_string(),
        name: format!("{id} flow"),
        pass: true,
        details: Some("ok".to_string()),
        error: None,
        affected_feature: None,
    }
}

fn failing(id: &str, feature: Option<&str>) -> StandardResult {
    StandardResult {
        id: id.to_string(),
        name: format!("{id} flow"),
        pass: false,
        details: None,
        error: Some(format!("{id} did not complete")),
        affected_feature: feature.map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

struct ScriptedGate {
    scaffold_ok: bool,
    post_merge: Mutex<VecDeque<bool>>,
    stages: Mutex<Vec<GateStage>>,
}

impl ScriptedGate {
    fn passing() -> Self {
        Self::scripted(true, &[])
    }

    fn scripted(scaffold_ok: bool, post_merge: &[bool]) -> Self {
        Self {
            scaffold_ok,
            post_merge: Mutex::new(post_merge.iter().copied().collect()),
            stages: Mutex::new(Vec::new()),
        }
    }

    fn stages(&self) -> Vec<GateStage> {
        self.stages.lock().expect("stages lock").clone()
    }
}

#[async_trait]
impl BuildGate for ScriptedGate {
    async fn verify(&self, stage: GateStage) -> GateReport {
        self.stages.lock().expect("stages lock").push(stage);
        let ok = match stage {
            GateStage::Scaffold => self.scaffold_ok,
            GateStage::PostMerge => self
                .post_merge
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(true),
        };
        if ok {
            GateReport::pass("check ok\n")
        } else {
            GateReport::fail("error[E0425]: cannot find value `cart_total`\n")
        }
    }
}

#[derive(Default)]
struct RecordingMerger {
    conflict_on: Option<String>,
    merged: Mutex<Vec<String>>,
    first_call: Mutex<Option<Instant>>,
}

impl RecordingMerger {
    fn merged(&self) -> Vec<String> {
        self.merged.lock().expect("merged lock").clone()
    }
}

#[async_trait]
impl Merger for RecordingMerger {
    async fn merge(&self, feature: &Feature) -> Result<MergeOutcome, VcsError> {
        self.first_call
            .lock()
            .expect("first call lock")
            .get_or_insert_with(Instant::now);
        if self.conflict_on.as_deref() == Some(feature.name.as_str()) {
            return Ok(MergeOutcome::Conflict {
                details: "conflicting files: src/app.rs".to_string(),
            });
        }
        self.merged
            .lock()
            .expect("merged lock")
            .push(feature.name.clone());
        Ok(MergeOutcome::Merged)
    }
}

struct FakePublisher {
    outcome: PrOutcome,
    calls: AtomicUsize,
}

impl FakePublisher {
    fn returning(outcome: PrOutcome) -> Self {
        Self {
            outcome,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PrPublisher for FakePublisher {
    async fn publish(&self, _request: &PrRequest) -> PrOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

type Runner = fn(&str, &[String]) -> Result<CommandOutput, PrError>;

/// Publisher driving the real precondition chain with a scripted runner.
struct RunnerPublisher {
    settings: PullRequestSettings,
    token_present: bool,
    runner: Runner,
}

#[async_trait]
impl PrPublisher for RunnerPublisher {
    async fn publish(&self, request: &PrRequest) -> PrOutcome {
        publish_with_runner(&self.settings, request, self.token_present, self.runner)
    }
}

fn output(success: bool, stdout: &str) -> CommandOutput {
    CommandOutput {
        success,
        exit_code: if success { 0 } else { 1 },
        stdout: stdout.to_string(),
        stderr: if success {
            String::new()
        } else {
            "command failed".to_string()
        },
    }
}

fn happy_runner(program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    match (program, args.first().map(String::as_str)) {
        ("git", Some("remote")) => Ok(output(true, "git@github.com:acme/shop.git\n")),
        ("gh", Some("repo")) => Ok(output(true, "release\n")),
        ("gh", Some("pr")) => Ok(output(true, "https://github.com/acme/shop/pull/7\n")),
        _ => Ok(output(true, "")),
    }
}

fn gh_missing_runner(program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    if program == "gh" {
        return Err(PrError {
            code: "command_missing",
            message: "'gh' was not found on PATH".to_string(),
        });
    }
    happy_runner(program, args)
}

fn unauthenticated_runner(program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    if program == "gh" && args.first().map(String::as_str) == Some("auth") {
        return Ok(output(false, ""));
    }
    happy_runner(program, args)
}

fn no_remote_runner(program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    if program == "git" && args.first().map(String::as_str) == Some("remote") {
        return Ok(output(false, ""));
    }
    happy_runner(program, args)
}

fn create_fails_runner(program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    if program == "gh" && args.first().map(String::as_str) == Some("pr") {
        return Ok(output(false, ""));
    }
    happy_runner(program, args)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    cfg: RuntimeConfig,
    bus: MessageBus,
    status: StatusStore,
    gate: Arc<ScriptedGate>,
    merger: Arc<RecordingMerger>,
}

fn harness(features: &[&str]) -> Harness {
    harness_with(features, ScriptedGate::passing(), RecordingMerger::default())
}

fn harness_with(features: &[&str], gate: ScriptedGate, merger: RecordingMerger) -> Harness {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path(), features);
    let bus = MessageBus::open(&cfg.root, cfg.delivery_mode).expect("bus should open");
    let status = StatusStore::open(&cfg.root).expect("status store should open");
    Harness {
        _dir: dir,
        cfg,
        bus,
        status,
        gate: Arc::new(gate),
        merger: Arc::new(merger),
    }
}

impl Harness {
    fn supervisor(&self, publisher: Arc<dyn PrPublisher>) -> Supervisor {
        Supervisor::new(
            self.cfg.clone(),
            self.bus.clone(),
            self.gate.clone(),
            self.merger.clone(),
            publisher,
            TelemetrySink::disabled(),
        )
        .expect("supervisor should build")
    }

    fn default_supervisor(&self) -> Supervisor {
        self.supervisor(Arc::new(FakePublisher::returning(PrOutcome::Created {
            url: "https://github.com/acme/shop/pull/1".to_string(),
        })))
    }

    fn complete_all(&self) {
        for feature in &self.cfg.features {
            self.status
                .append(&feature.name, AgentState::Complete, "feature done")
                .expect("status should append");
        }
    }

    fn messages(&self) -> Vec<Message> {
        self.bus
            .read_all_from(0)
            .expect("bus should read")
            .messages
    }

    fn count(&self, to: &str, matches: impl Fn(&Intent) -> bool) -> usize {
        self.messages()
            .iter()
            .filter(|message| message.to == to && matches(&message.intent()))
            .count()
    }

    fn ledger_records(&self) -> Vec<LedgerRecord> {
        read_ledger(&self.cfg.root.join("ledger.jsonl")).expect("ledger should read")
    }

    fn spawn_qa(
        &self,
        script: Vec<Vec<StandardResult>>,
        fallback: Vec<StandardResult>,
    ) -> JoinHandle<usize> {
        let bus = self.bus.clone();
        let root = self.cfg.root.clone();
        tokio::spawn(async move {
            let reports = ReportStore::open(&root).expect("report store should open");
            let mut qa = QaHandle::new(bus, reports, None, "qa");
            let mut script = VecDeque::from(script);
            let mut runs = 0;
            loop {
                let poll = qa.poll().expect("qa poll should succeed");
                if poll.run.is_some() {
                    runs += 1;
                    let results = script.pop_front().unwrap_or_else(|| fallback.clone());
                    qa.submit(QaReport::new(results))
                        .expect("qa submit should succeed");
                }
                if poll.exit {
                    return runs;
                }
                qa.wait(Duration::from_millis(20)).await;
            }
        })
    }

    fn spawn_worker(&self, name: &str) -> JoinHandle<usize> {
        let mut worker = WorkerHandle::new(self.bus.clone(), self.status.clone(), name);
        tokio::spawn(async move {
            let mut fixes = 0;
            loop {
                let inbox = worker.poll().expect("worker poll should succeed");
                if !inbox.fixes.is_empty() {
                    fixes += inbox.fixes.len();
                    worker.complete("fix applied").expect("worker should complete");
                }
                if inbox.exit {
                    return fixes;
                }
                worker.wait(Duration::from_millis(20)).await;
            }
        })
    }
}

async fn run_to_end(supervisor: &mut Supervisor) -> RunOutcome {
    tokio::time::timeout(Duration::from_secs(20), supervisor.run())
        .await
        .expect("run should finish in time")
        .expect("run should succeed")
}

// ---------------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------------

#[test]
fn mailbox_delivers_in_append_order_per_recipient() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus should open");
    bus.send("supervisor", "auth", "first").expect("send");
    bus.send("supervisor", "cart", "not for auth").expect("send");
    bus.send("qa", "all", "second").expect("send");
    bus.send("supervisor", "auth", "third").expect("send");

    let mut mailbox = Mailbox::new(bus.clone(), "auth");
    let bodies = mailbox
        .receive()
        .expect("receive")
        .into_iter()
        .map(|m| m.body)
        .collect::<Vec<_>>();
    assert_eq!(bodies, vec!["first", "second", "third"]);

    bus.send("supervisor", "auth", "fourth").expect("send");
    let later = mailbox.receive().expect("receive");
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].body, "fourth");
    assert!(mailbox.receive().expect("receive").is_empty());
}

#[test]
fn broadcast_is_not_echoed_to_its_sender() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus should open");
    bus.send("qa", BROADCAST_AGENT, "heads up").expect("send");
    assert!(
        Mailbox::new(bus.clone(), "qa")
            .receive()
            .expect("receive")
            .is_empty()
    );
    assert_eq!(Mailbox::new(bus, "auth").receive().expect("receive").len(), 1);
}

#[test]
fn persistent_mailbox_cursor_survives_reopen() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus should open");
    let cursors = dir.path().join("cursors");
    bus.send("supervisor", "auth", "one").expect("send");

    let mut mailbox = Mailbox::persistent(bus.clone(), "auth", &cursors).expect("mailbox");
    assert_eq!(mailbox.peek().expect("peek").len(), 1);
    assert_eq!(mailbox.receive().expect("receive").len(), 1);

    bus.send("supervisor", "auth", "two").expect("send");
    let mut reopened = Mailbox::persistent(bus, "auth", &cursors).expect("mailbox");
    let messages = reopened.receive().expect("receive");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "two");
}

#[test]
fn malformed_records_are_skipped_and_counted() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus should open");
    std::fs::write(
        bus.path(),
        "stray text\n=== MESSAGE ===\nfrom: auth\nno recipient here\n\
         === MESSAGE ===\ntimestamp: yesterday\nfrom: auth\nto: supervisor\nbad clock\n",
    )
    .expect("seed log");
    bus.send("auth", "supervisor", "WORKER_COMPLETE").expect("send");

    let read = bus.read_all_from(0).expect("read");
    assert_eq!(read.malformed, 3);
    assert_eq!(read.messages.len(), 1);
    assert_eq!(read.messages[0].intent(), Intent::WorkerComplete);

    let mut mailbox = Mailbox::new(bus, "supervisor");
    assert_eq!(mailbox.receive().expect("receive").len(), 1);
}

#[test]
fn concurrent_writers_never_interleave_records() {
    const WRITERS: usize = 6;
    const PER_WRITER: usize = 40;
    let dir = tempdir().expect("temp directory should create");
    let root = dir.path().to_path_buf();

    let handles = (0..WRITERS)
        .map(|writer| {
            let root = root.clone();
            std::thread::spawn(move || {
                let bus = MessageBus::open(&root, DeliveryMode::Pull).expect("bus should open");
                let from = format!("worker-{writer}");
                for seq in 0..PER_WRITER {
                    bus.send(&from, "supervisor", &format!("{seq}\nline two of {from}"))
                        .expect("send should succeed");
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("writer thread should not panic");
    }

    let bus = MessageBus::open(&root, DeliveryMode::Pull).expect("bus should open");
    let read = bus.read_all_from(0).expect("read should succeed");
    assert_eq!(read.malformed, 0);
    assert_eq!(read.messages.len(), WRITERS * PER_WRITER);

    let mut next = BTreeMap::<String, usize>::new();
    for message in &read.messages {
        let seq = message
            .body
            .lines()
            .next()
            .and_then(|line| line.parse::<usize>().ok())
            .expect("body should start with a sequence number");
        let expected = next.entry(message.from.clone()).or_insert(0);
        assert_eq!(seq, *expected, "messages from {} out of order", message.from);
        assert!(message.body.ends_with(&format!("line two of {}", message.from)));
        *expected += 1;
    }
    assert!(next.values().all(|count| *count == PER_WRITER));
}

#[tokio::test]
async fn push_mode_wakes_a_waiting_recipient() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Push).expect("bus should open");
    let mailbox = Mailbox::new(bus.clone(), "supervisor");
    let sender = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender
            .send("auth", "supervisor", "WORKER_COMPLETE")
            .expect("send");
    });

    let started = Instant::now();
    mailbox.wait(Duration::from_secs(10)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(mailbox.peek().expect("peek").len(), 1);
}

// ---------------------------------------------------------------------------
// Status store
// ---------------------------------------------------------------------------

#[test]
fn status_history_is_monotonic() {
    let dir = tempdir().expect("temp directory should create");
    let store = StatusStore::open(dir.path()).expect("status store");
    store
        .append("auth", AgentState::Pending, "registered")
        .expect("pending");
    store
        .append("auth", AgentState::InProgress, "started")
        .expect("in progress");
    store
        .append("auth", AgentState::Complete, "done")
        .expect("complete");

    let err = store
        .append("auth", AgentState::Pending, "reset")
        .expect_err("complete must not revert to pending");
    assert!(err.downcast_ref::<StatusTransitionError>().is_some());
    store
        .append("auth", AgentState::Testing, "retest")
        .expect_err("complete only re-opens into in-progress");

    store
        .append("auth", AgentState::InProgress, "re-opened by fix task STD-003")
        .expect("re-open");
    let history = store.history("auth").expect("history");
    assert_eq!(history.len(), 4);
    assert_eq!(
        store.current("auth").expect("current").map(|e| e.state),
        Some(AgentState::InProgress)
    );
}

#[test]
fn snapshot_requires_every_feature_exactly_complete() {
    let dir = tempdir().expect("temp directory should create");
    let store = StatusStore::open(dir.path()).expect("status store");
    let agents = vec!["auth".to_string(), "cart".to_string()];

    store
        .append("auth", AgentState::Complete, "done")
        .expect("complete");
    let snapshot = store.snapshot(&agents).expect("snapshot");
    assert!(!snapshot.all_complete());
    assert_eq!(snapshot.incomplete(), vec!["cart".to_string()]);

    store
        .append("cart", AgentState::Testing, "running tests")
        .expect("testing");
    assert!(!store.snapshot(&agents).expect("snapshot").all_complete());

    store
        .append("cart", AgentState::Complete, "done")
        .expect("complete");
    assert!(store.snapshot(&agents).expect("snapshot").all_complete());
}

#[test]
fn worker_fix_task_reopens_and_complete_notifies_supervisor() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus");
    let status = StatusStore::open(dir.path()).expect("status");
    let mut worker = WorkerHandle::new(bus.clone(), status.clone(), "auth");
    worker
        .set_status(AgentState::Complete, "done")
        .expect("complete");

    bus.send("supervisor", "auth", "FIX_TASK: STD-003 failed\n\nlogin button missing")
        .expect("send");
    let inbox = worker.poll().expect("poll");
    assert_eq!(inbox.fixes.len(), 1);
    assert_eq!(inbox.fixes[0].standard_id, "STD-003");
    assert_eq!(
        status.current("auth").expect("current").map(|e| e.state),
        Some(AgentState::InProgress)
    );

    worker.complete("login fixed").expect("complete");
    let mut supervisor_box = Mailbox::new(bus, SUPERVISOR_AGENT);
    let messages = supervisor_box.receive().expect("receive");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].intent(), Intent::WorkerComplete);
}

// ---------------------------------------------------------------------------
// Reports and QA
// ---------------------------------------------------------------------------

#[test]
fn report_summary_is_recomputed_from_results() {
    let json = r#"{
        "timestamp": "2026-10-19T12:00:00.000Z",
        "overall_pass": true,
        "results": [
            {"id": "STD-001", "name": "signup", "pass": true, "details": "ok"},
            {"id": "STD-003", "name": "login", "pass": false, "error": "button missing", "affected_feature": "auth"}
        ],
        "summary": {"total": 2, "passed": 2, "failed": 0}
    }"#;
    let report = parse_report(json).expect("report should parse");
    assert!(!report.overall_pass);
    assert_eq!(
        report.summary,
        ReportSummary {
            total: 2,
            passed: 1,
            failed: 1
        }
    );
    assert_eq!(report.failures().count(), 1);
}

#[test]
fn report_store_latest_pointer_tracks_newest_report() {
    let dir = tempdir().expect("temp directory should create");
    let store = ReportStore::open(dir.path()).expect("report store");
    assert!(store.latest().expect("latest").is_none());

    let first = QaReport::new(vec![failing("STD-003", Some("auth"))]);
    store.store(&first).expect("store first");
    let second = QaReport::new(vec![passing("STD-003")]);
    let path = store.store(&second).expect("store second");

    assert_eq!(store.count().expect("count"), 2);
    assert_eq!(store.latest_path().expect("latest path"), Some(path));
    assert!(store.latest().expect("latest").expect("some report").overall_pass);
}

#[test]
fn catalog_coverage_must_match_one_to_one() {
    let catalog = StandardsCatalog {
        standards: vec![
            Standard {
                id: "STD-001".to_string(),
                description: "User can sign up".to_string(),
            },
            Standard {
                id: "STD-003".to_string(),
                description: "User can log in".to_string(),
            },
        ],
    };
    let complete = QaReport::new(vec![passing("STD-001"), passing("STD-003")]);
    catalog.check_coverage(&complete).expect("full coverage");

    let missing = QaReport::new(vec![passing("STD-001")]);
    assert!(catalog.check_coverage(&missing).is_err());
    let duplicated = QaReport::new(vec![
        passing("STD-001"),
        passing("STD-003"),
        passing("STD-003"),
    ]);
    assert!(catalog.check_coverage(&duplicated).is_err());
}

#[test]
fn standards_catalog_loads_from_toml() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("standards.toml");
    std::fs::write(
        &path,
        "[[standards]]\nid = \"STD-001\"\ndescription = \"sign up\"\n\n\
         [[standards]]\nid = \"STD-003\"\ndescription = \"log in\"\n",
    )
    .expect("write catalog");
    let catalog = StandardsCatalog::load(&path).expect("catalog should load");
    assert_eq!(catalog.standards.len(), 2);
    assert_eq!(
        catalog.get("STD-003").map(|s| s.description.as_str()),
        Some("log in")
    );
}

#[test]
fn qa_refuses_second_run_while_report_is_outstanding() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus");
    let reports = ReportStore::open(dir.path()).expect("reports");
    let mut qa = QaHandle::new(bus.clone(), reports, None, "qa");

    bus.send("supervisor", "qa", "RUN_QA").expect("send");
    bus.send("supervisor", "qa", "RUN_QA").expect("send");
    let poll = qa.poll().expect("poll");
    assert!(poll.run.is_some());
    assert_eq!(poll.refused, 1);
    assert!(qa.run_open());

    qa.submit(QaReport::new(vec![passing("STD-001")]))
        .expect("submit");
    assert!(!qa.run_open());

    let results = Mailbox::new(bus, SUPERVISOR_AGENT)
        .receive()
        .expect("receive")
        .into_iter()
        .filter(|m| matches!(m.intent(), Intent::QaResult(_)))
        .count();
    assert_eq!(results, 1);
}

#[test]
fn qa_submit_rejects_report_outside_catalog() {
    let dir = tempdir().expect("temp directory should create");
    let bus = MessageBus::open(dir.path(), DeliveryMode::Pull).expect("bus");
    let reports = ReportStore::open(dir.path()).expect("reports");
    let catalog = StandardsCatalog {
        standards: vec![Standard {
            id: "STD-001".to_string(),
            description: "sign up".to_string(),
        }],
    };
    let mut qa = QaHandle::new(bus.clone(), reports.clone(), Some(catalog), "qa");
    qa.submit(QaReport::new(vec![passing("STD-999")]))
        .expect_err("unknown standard must be rejected");
    assert_eq!(reports.count().expect("count"), 0);
    assert!(bus.read_all_from(0).expect("read").messages.is_empty());
}

// ---------------------------------------------------------------------------
// Fix routing
// ---------------------------------------------------------------------------

#[test]
fn failed_standard_routes_to_affected_feature() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path(), &["auth", "cart"]);
    let report = QaReport::new(vec![
        passing("STD-001"),
        failing("STD-003", Some("auth")),
        passing("STD-004"),
    ]);
    let tasks = build_fix_tasks(&report, &cfg, None, 1);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].target, "auth");
    assert_eq!(tasks[0].standard_id, "STD-003");
    assert!(tasks[0].message_body().starts_with("FIX_TASK: STD-003 failed"));
}

#[test]
fn ownership_table_and_unknown_sentinel_route_the_rest() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path(), &["auth", "cart"]);
    cfg.ownership
        .insert("STD-007".to_string(), "cart".to_string());
    let report = QaReport::new(vec![
        failing("STD-007", None),
        failing("STD-009", Some("payments")),
        failing("STD-009", Some("payments")),
    ]);
    let tasks = build_fix_tasks(&report, &cfg, None, 2);
    let routed = tasks
        .iter()
        .map(|t| (t.target.as_str(), t.standard_id.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(routed, vec![("cart", "STD-007"), (UNKNOWN_OWNER, "STD-009")]);
}

#[test]
fn build_failure_routing_follows_configuration() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path(), &["auth", "cart"]);
    let tasks = build_failure_tasks(&cfg, Some("cart"), "boom", 1);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].target, "cart");
    assert_eq!(tasks[0].standard_id, BUILD_BROKEN_STANDARD);

    cfg.build_failure_routing = BuildFailureRouting::All;
    let targets = build_failure_tasks(&cfg, Some("cart"), "boom", 1)
        .into_iter()
        .map(|t| t.target)
        .collect::<Vec<_>>();
    assert_eq!(targets, vec!["auth".to_string(), "cart".to_string()]);
}

#[test]
fn fix_task_document_is_written_under_target_directory() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path(), &["auth"]);
    let report = QaReport::new(vec![failing("STD-003", Some("auth"))]);
    let task = build_fix_tasks(&report, &cfg, None, 1).remove(0);
    let path = task.save(dir.path()).expect("save");
    assert_eq!(
        path,
        dir.path().join("fix-tasks/auth/cycle-1-STD-003.md")
    );
    let doc = std::fs::read_to_string(path).expect("read doc");
    assert!(doc.contains("Target feature: auth"));
    assert!(doc.contains("STD-003 did not complete"));
    assert!(doc.contains("## Required actions"));
}

// ---------------------------------------------------------------------------
// Ledger and markers
// ---------------------------------------------------------------------------

#[test]
fn markers_are_a_projection_of_the_ledger() {
    let dir = tempdir().expect("temp directory should create");
    let mut ledger = Ledger::open(dir.path()).expect("ledger");
    ledger
        .record(LedgerEvent::RunStarted {
            features: vec!["auth".to_string()],
            max_cycles: 3,
        })
        .expect("record");
    ledger
        .record(LedgerEvent::CycleStarted { cycle: 1 })
        .expect("record");
    ledger
        .record(LedgerEvent::AllMerged { cycle: 1 })
        .expect("record");
    ledger
        .record(LedgerEvent::BuildVerified { cycle: 1 })
        .expect("record");
    assert!(ledger.markers().is_present(Marker::AllMerged));
    assert!(ledger.markers().is_present(Marker::BuildVerified));

    ledger
        .record(LedgerEvent::MergeCleared { cycle: 1 })
        .expect("record");
    assert!(!ledger.markers().is_present(Marker::AllMerged));
    assert!(!ledger.markers().is_present(Marker::BuildVerified));

    ledger
        .record(LedgerEvent::AllMerged { cycle: 1 })
        .expect("record");
    std::fs::remove_dir_all(dir.path().join("markers")).expect("drop markers");
    let reopened = Ledger::open(dir.path()).expect("reopen");
    assert!(reopened.view().is_set(Marker::AllMerged));
    reopened
        .markers()
        .sync(reopened.view())
        .expect("markers rebuild");
    assert!(reopened.markers().is_present(Marker::AllMerged));
}

#[test]
fn qa_in_flight_flag_follows_signal_and_result() {
    let dir = tempdir().expect("temp directory should create");
    let mut ledger = Ledger::open(dir.path()).expect("ledger");
    ledger
        .record(LedgerEvent::QaSignalled { cycle: 1 })
        .expect("record");
    assert!(ledger.view().qa_in_flight);
    ledger
        .record(LedgerEvent::QaResult {
            cycle: 1,
            pass: false,
            failed: 1,
        })
        .expect("record");
    assert!(!ledger.view().qa_in_flight);
    assert!(ledger.view().is_set(Marker::QaNeedsFixes));
}

// ---------------------------------------------------------------------------
// Supervisor scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_completes_and_sends_exit_exactly_once() {
    let h = harness(&["auth", "cart"]);
    h.complete_all();
    let qa = h.spawn_qa(Vec::new(), vec![passing("STD-001"), passing("STD-003")]);

    let publisher = Arc::new(FakePublisher::returning(PrOutcome::Created {
        url: "https://github.com/acme/shop/pull/1".to_string(),
    }));
    let mut supervisor = h.supervisor(publisher.clone());
    let outcome = run_to_end(&mut supervisor).await;

    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        outcome,
        RunOutcome::Complete {
            cycles: 1,
            pull_request: PrOutcome::Created { .. }
        }
    ));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(h.merger.merged(), vec!["auth".to_string(), "cart".to_string()]);
    assert_eq!(
        h.gate.stages(),
        vec![GateStage::Scaffold, GateStage::PostMerge]
    );
    assert!(supervisor.ledger().markers().is_present(Marker::ProjectComplete));
    assert_eq!(supervisor.phase(), Phase::Done);

    for agent in ["auth", "cart", "qa"] {
        assert_eq!(
            h.count(agent, |intent| *intent == Intent::Exit),
            1,
            "agent {agent} should receive exactly one /exit"
        );
    }
    assert_eq!(h.count("qa", |intent| *intent == Intent::RunQa), 1);

    let runs = tokio::time::timeout(Duration::from_secs(5), qa)
        .await
        .expect("qa should stop on /exit")
        .expect("qa task should not panic");
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn one_failing_standard_assigns_one_fix_task_and_clears_merge() {
    let h = harness(&["auth", "cart"]);
    h.complete_all();
    let qa = h.spawn_qa(
        vec![vec![
            passing("STD-001"),
            failing("STD-003", Some("auth")),
        ]],
        vec![passing("STD-001"), passing("STD-003")],
    );
    let auth = h.spawn_worker("auth");
    let cart = h.spawn_worker("cart");

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Complete { cycles: 2, .. }));

    let fixes = h
        .messages()
        .into_iter()
        .filter(|m| matches!(m.intent(), Intent::FixTask { .. }))
        .collect::<Vec<_>>();
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].to, "auth");
    assert_eq!(
        fixes[0].intent(),
        Intent::FixTask {
            standard_id: "STD-003".to_string()
        }
    );
    assert!(h.cfg.root.join("fix-tasks/auth/cycle-1-STD-003.md").exists());

    let records = h.ledger_records();
    let cleared_at = records
        .iter()
        .position(|r| r.event == LedgerEvent::MergeCleared { cycle: 1 })
        .expect("merge marker should be cleared in cycle 1");
    let view = MarkerView::replay(&records[..=cleared_at]);
    assert!(!view.is_set(Marker::AllMerged));
    assert!(view.is_set(Marker::QaNeedsFixes));

    assert_eq!(auth.await.expect("auth task"), 1);
    assert_eq!(cart.await.expect("cart task"), 0);
    assert_eq!(qa.await.expect("qa task"), 2);
}

#[tokio::test]
async fn retry_budget_escalates_without_further_qa() {
    let h = harness(&["auth"]);
    h.complete_all();
    let qa = h.spawn_qa(Vec::new(), vec![failing("STD-003", Some("auth"))]);
    let auth = h.spawn_worker("auth");

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Escalated { cycles: 3, .. }));
    assert_eq!(outcome.exit_code(), 2);
    assert!(supervisor.ledger().view().escalated);
    assert!(!supervisor.ledger().markers().is_present(Marker::ProjectComplete));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.count("qa", |intent| *intent == Intent::RunQa), 3);
    // Cycles 1 and 2 route fixes; the final failure is escalated instead.
    assert_eq!(
        h.count("auth", |intent| matches!(intent, Intent::FixTask { .. })),
        2
    );
    assert_eq!(h.count("auth", |intent| *intent == Intent::Exit), 0);

    qa.abort();
    auth.abort();
}

#[tokio::test]
async fn second_run_qa_is_refused_while_in_flight() {
    let h = harness(&["auth"]);
    let mut supervisor = h.default_supervisor();
    supervisor.signal_qa(1).expect("first signal");
    let err = supervisor
        .signal_qa(1)
        .expect_err("second signal must be refused");
    assert!(format!("{err:#}").contains("already in flight"));
    assert_eq!(h.count("qa", |intent| *intent == Intent::RunQa), 1);
}

#[tokio::test]
async fn merge_waits_for_every_feature_in_one_snapshot() {
    let h = harness(&["auth", "cart"]);
    h.status
        .append("auth", AgentState::Complete, "done")
        .expect("auth complete");
    h.status
        .append("cart", AgentState::InProgress, "still working")
        .expect("cart in progress");
    let qa = h.spawn_qa(Vec::new(), vec![passing("STD-001")]);

    let cart_done_at = Arc::new(Mutex::new(None::<Instant>));
    let finisher = {
        let bus = h.bus.clone();
        let status = h.status.clone();
        let merger = h.merger.clone();
        let cart_done_at = cart_done_at.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(
                merger.first_call.lock().expect("lock").is_none(),
                "merge must not start before cart is complete"
            );
            let worker = WorkerHandle::new(bus, status, "cart");
            *cart_done_at.lock().expect("lock") = Some(Instant::now());
            worker.complete("done").expect("cart complete");
        })
    };

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Complete { .. }));
    finisher.await.expect("finisher should not panic");

    let done = cart_done_at.lock().expect("lock").expect("cart finished");
    let merged = h
        .merger
        .first_call
        .lock()
        .expect("lock")
        .expect("merge happened");
    assert!(merged >= done);
    qa.await.expect("qa task");
}

#[test]
fn blocked_worker_can_report_complete_directly() {
    let h = harness(&["auth"]);
    h.status
        .append("auth", AgentState::Blocked, "waiting on credentials")
        .expect("blocked");
    h.status
        .append("auth", AgentState::Complete, "credentials arrived, done")
        .expect("blocked agent should be allowed to complete");
    let current = h
        .status
        .current("auth")
        .expect("status should read")
        .expect("auth should have a status");
    assert_eq!(current.state, AgentState::Complete);
}

#[tokio::test]
async fn blocked_worker_is_surfaced_once() {
    let h = harness(&["auth"]);
    h.status
        .append("auth", AgentState::Blocked, "need API credentials")
        .expect("blocked");
    let qa = h.spawn_qa(Vec::new(), vec![passing("STD-001")]);

    let finisher = {
        let bus = h.bus.clone();
        let status = h.status.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let worker = WorkerHandle::new(bus, status, "auth");
            worker
                .set_status(AgentState::InProgress, "unblocked")
                .expect("in progress");
            worker.complete("done").expect("complete");
        })
    };

    let mut supervisor = h.default_supervisor();
    run_to_end(&mut supervisor).await;
    finisher.await.expect("finisher");
    qa.await.expect("qa");

    let blocked = h
        .ledger_records()
        .into_iter()
        .filter(|r| matches!(r.event, LedgerEvent::WorkerBlocked { .. }))
        .count();
    assert_eq!(blocked, 1);
}

#[tokio::test]
async fn scaffold_failure_halts_before_any_merge() {
    let h = harness_with(
        &["auth"],
        ScriptedGate::scripted(false, &[]),
        RecordingMerger::default(),
    );
    h.complete_all();
    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(
        outcome,
        RunOutcome::Halted {
            failure: FailureKind::ScaffoldFailure,
            ..
        }
    ));
    assert_eq!(outcome.exit_code(), 1);
    assert!(h.merger.merged().is_empty());
    assert!(h.messages().is_empty());
}

#[tokio::test]
async fn merge_conflict_halts_and_names_the_feature() {
    let h = harness_with(
        &["auth", "cart"],
        ScriptedGate::passing(),
        RecordingMerger {
            conflict_on: Some("cart".to_string()),
            ..RecordingMerger::default()
        },
    );
    h.complete_all();
    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    match outcome {
        RunOutcome::Halted { failure, reason } => {
            assert_eq!(failure, FailureKind::MergeConflict);
            assert!(reason.contains("cart"));
        }
        other => panic!("expected halt, got {other:?}"),
    }
    assert_eq!(h.merger.merged(), vec!["auth".to_string()]);
    assert_eq!(h.count("qa", |intent| *intent == Intent::RunQa), 0);
}

#[tokio::test]
async fn broken_build_routes_fix_to_last_merged_feature() {
    let h = harness_with(
        &["auth", "cart"],
        ScriptedGate::scripted(true, &[false, true]),
        RecordingMerger::default(),
    );
    h.complete_all();
    let qa = h.spawn_qa(Vec::new(), vec![passing("STD-001")]);
    let auth = h.spawn_worker("auth");
    let cart = h.spawn_worker("cart");

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Complete { cycles: 2, .. }));

    assert_eq!(
        h.count("cart", |intent| *intent
            == Intent::FixTask {
                standard_id: BUILD_BROKEN_STANDARD.to_string()
            }),
        1
    );
    assert_eq!(
        h.count("auth", |intent| matches!(intent, Intent::FixTask { .. })),
        0
    );
    assert_eq!(h.count("qa", |intent| *intent == Intent::RunQa), 1);
    assert_eq!(cart.await.expect("cart"), 1);
    assert_eq!(auth.await.expect("auth"), 0);
    qa.await.expect("qa");
}

#[tokio::test]
async fn unowned_failures_go_to_triage_until_budget_is_spent() {
    let h = harness(&["auth"]);
    h.complete_all();
    let qa = h.spawn_qa(Vec::new(), vec![failing("STD-042", None)]);

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Escalated { cycles: 3, .. }));
    assert!(h.cfg.root.join("fix-tasks/unknown/cycle-1-STD-042.md").exists());
    assert!(h.cfg.root.join("fix-tasks/unknown/cycle-3-STD-042.md").exists());
    assert_eq!(
        h.count(UNKNOWN_OWNER, |intent| *intent
            == Intent::FixTask {
                standard_id: "STD-042".to_string()
            }),
        2
    );

    let records = h.ledger_records();
    let cleared = records
        .iter()
        .filter(|r| matches!(r.event, LedgerEvent::MergeCleared { .. }))
        .count();
    assert_eq!(cleared, 2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.count("qa", |intent| *intent == Intent::RunQa), 3);
    qa.abort();
}

#[tokio::test]
async fn unowned_failure_alongside_owned_one_goes_to_triage() {
    let h = harness(&["auth"]);
    h.complete_all();
    let qa = h.spawn_qa(
        vec![vec![failing("STD-003", Some("auth")), failing("STD-042", None)]],
        vec![passing("STD-003"), passing("STD-042")],
    );
    let auth = h.spawn_worker("auth");

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Complete { cycles: 2, .. }));
    assert!(h.cfg.root.join("fix-tasks/unknown/cycle-1-STD-042.md").exists());
    assert_eq!(
        h.count(UNKNOWN_OWNER, |intent| matches!(intent, Intent::FixTask { .. })),
        1
    );
    assert_eq!(auth.await.expect("auth task"), 1);
    qa.await.expect("qa task");
}

#[tokio::test]
async fn exit_text_inside_failure_details_does_not_cancel_the_run() {
    let h = harness(&["auth"]);
    h.complete_all();
    let mut login = failing("STD-003", Some("auth"));
    login.error = Some("expected redirect to /login, got /exit".to_string());
    let qa = h.spawn_qa(vec![vec![login]], vec![passing("STD-003")]);
    let auth = h.spawn_worker("auth");

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Complete { cycles: 2, .. }));
    assert_eq!(
        h.count("auth", |intent| *intent
            == Intent::FixTask {
                standard_id: "STD-003".to_string()
            }),
        1
    );
    assert_eq!(h.count("auth", |intent| *intent == Intent::Exit), 1);
    assert_eq!(auth.await.expect("auth task"), 1);
    assert_eq!(qa.await.expect("qa task"), 2);
}

#[tokio::test]
async fn exit_message_cancels_monitoring() {
    let h = harness(&["auth"]);
    h.status
        .append("auth", AgentState::InProgress, "working")
        .expect("in progress");
    let bus = h.bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.send("operator", SUPERVISOR_AGENT, "/exit").expect("send");
    });

    let mut supervisor = h.default_supervisor();
    let outcome = run_to_end(&mut supervisor).await;
    assert_eq!(
        outcome,
        RunOutcome::Cancelled {
            by: "operator".to_string()
        }
    );
    assert!(supervisor.ledger().view().halted);
}

// ---------------------------------------------------------------------------
// Pull request publication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pull_request_problems_never_block_completion() {
    let cases: [(&str, bool, Runner, fn(&PrOutcome) -> bool); 4] = [
        ("gh missing", true, gh_missing_runner, |o| {
            matches!(o, PrOutcome::Skipped { .. })
        }),
        ("no auth", false, unauthenticated_runner, |o| {
            matches!(o, PrOutcome::Skipped { .. })
        }),
        ("no remote", true, no_remote_runner, |o| {
            matches!(o, PrOutcome::Skipped { .. })
        }),
        ("pr create fails", true, create_fails_runner, |o| {
            matches!(o, PrOutcome::Failed { .. })
        }),
    ];

    for (label, token_present, runner, expected) in cases {
        let h = harness(&["auth"]);
        h.complete_all();
        let qa = h.spawn_qa(Vec::new(), vec![passing("STD-001")]);
        let publisher = Arc::new(RunnerPublisher {
            settings: h.cfg.pull_request.clone(),
            token_present,
            runner,
        });
        let mut supervisor = h.supervisor(publisher);
        let outcome = run_to_end(&mut supervisor).await;

        match &outcome {
            RunOutcome::Complete { pull_request, .. } => {
                assert!(expected(pull_request), "{label}: unexpected {pull_request:?}")
            }
            other => panic!("{label}: expected completion, got {other:?}"),
        }
        assert!(
            supervisor.ledger().markers().is_present(Marker::ProjectComplete),
            "{label}: project-complete marker must be written"
        );
        assert_eq!(h.count("auth", |intent| *intent == Intent::Exit), 1);
        qa.await.expect("qa task");
    }
}

#[test]
fn pull_request_runs_push_then_create_when_preconditions_hold() {
    let settings = base_cfg(Path::new("/tmp/unused"), &["auth"]).pull_request;
    let request = PrRequest {
        title: "Merge features: auth".to_string(),
        body: "body".to_string(),
        head: "main".to_string(),
    };
    let calls = std::cell::RefCell::new(Vec::<String>::new());
    let outcome = publish_with_runner(&settings, &request, true, |program, args| {
        calls
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        happy_runner(program, args)
    });
    assert_eq!(
        outcome,
        PrOutcome::Created {
            url: "https://github.com/acme/shop/pull/7".to_string()
        }
    );
    let calls = calls.borrow();
    assert_eq!(calls[0], "gh --version");
    assert_eq!(calls[1], "git remote get-url origin");
    assert_eq!(
        calls[2],
        "gh repo view --json defaultBranchRef -q .defaultBranchRef.name"
    );
    assert_eq!(calls[3], "git push origin main");
    assert!(calls[4].starts_with("gh pr create --title Merge features: auth"));
    assert!(calls[4].contains("--head main --base release"));
}

fn trunk_is_default_runner(program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    if program == "gh" && args.first().map(String::as_str) == Some("repo") {
        return Ok(output(true, "main\n"));
    }
    happy_runner(program, args)
}

#[test]
fn trunk_that_is_the_default_branch_is_skipped_before_pushing() {
    let settings = base_cfg(Path::new("/tmp/unused"), &["auth"]).pull_request;
    let request = PrRequest {
        title: "t".to_string(),
        body: "b".to_string(),
        head: "main".to_string(),
    };
    let calls = std::cell::RefCell::new(Vec::<String>::new());
    let outcome = publish_with_runner(&settings, &request, true, |program, args| {
        calls
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        trunk_is_default_runner(program, args)
    });
    assert!(
        matches!(&outcome, PrOutcome::Skipped { reason } if reason.contains("pull_request.base")),
        "unexpected {outcome:?}"
    );
    assert!(!calls.borrow().iter().any(|call| call.starts_with("git push")));
}

#[test]
fn configured_base_skips_the_default_branch_lookup() {
    let mut settings = base_cfg(Path::new("/tmp/unused"), &["auth"]).pull_request;
    settings.base = Some("develop".to_string());
    let request = PrRequest {
        title: "t".to_string(),
        body: "b".to_string(),
        head: "main".to_string(),
    };
    let calls = std::cell::RefCell::new(Vec::<String>::new());
    let outcome = publish_with_runner(&settings, &request, true, |program, args| {
        calls
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        trunk_is_default_runner(program, args)
    });
    assert!(matches!(outcome, PrOutcome::Created { .. }));
    let calls = calls.borrow();
    assert!(!calls.iter().any(|call| call.starts_with("gh repo")));
    let create = calls.last().expect("pr create should run");
    assert!(create.contains("--base develop"));

    settings.base = Some("main".to_string());
    let outcome = publish_with_runner(&settings, &request, true, happy_runner);
    assert!(matches!(outcome, PrOutcome::Skipped { .. }));
}

#[test]
fn unsupported_remote_host_is_skipped() {
    let mut settings = base_cfg(Path::new("/tmp/unused"), &["auth"]).pull_request;
    settings.supported_hosts = vec!["github.example.com".to_string()];
    let request = PrRequest {
        title: "t".to_string(),
        body: "b".to_string(),
        head: "main".to_string(),
    };
    let outcome = publish_with_runner(&settings, &request, true, happy_runner);
    assert!(matches!(outcome, PrOutcome::Skipped { reason } if reason.contains("github.com")));

    settings.enabled = false;
    let outcome = publish_with_runner(&settings, &request, true, happy_runner);
    assert!(matches!(outcome, PrOutcome::Skipped { .. }));
}

// ---------------------------------------------------------------------------
// Build gate
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn shell_gate(dir: &Path, check: &str, start: Option<&str>) -> ShellBuildGate {
    ShellBuildGate::new(
        dir.to_path_buf(),
        BuildSettings {
            install: Some("true".to_string()),
            check: Some(check.to_string()),
            start: start.map(str::to_string),
            smoke_grace: Duration::from_millis(300),
            command_timeout: Duration::from_secs(10),
        },
        dir.join("logs"),
    )
}

#[cfg(unix)]
#[tokio::test]
async fn shell_gate_reports_failing_check() {
    let dir = tempdir().expect("temp directory should create");
    let gate = shell_gate(dir.path(), "echo type error >&2; exit 3", None);
    let report = gate.verify(GateStage::PostMerge).await;
    assert!(!report.ok);
    assert!(report.log.contains("type error"));
}

#[cfg(unix)]
#[tokio::test]
async fn shell_gate_smoke_start_requires_surviving_grace_period() {
    let dir = tempdir().expect("temp directory should create");
    let surviving = shell_gate(dir.path(), "true", Some("echo listening; sleep 30"));
    let report = surviving.verify(GateStage::PostMerge).await;
    assert!(report.ok, "log: {}", report.log);
    assert!(report.log.contains("listening"));

    let crashing = shell_gate(dir.path(), "true", Some("echo port in use; exit 1"));
    assert!(!crashing.verify(GateStage::PostMerge).await.ok);
    // The scaffold check never starts the service.
    assert!(crashing.verify(GateStage::Scaffold).await.ok);
}

#[test]
fn gate_log_keeps_the_tail() {
    let text = "a".repeat(10) + "END";
    let (tail, truncated) = tail_text(&text, 5);
    assert!(truncated);
    assert!(tail.ends_with("aaEND"));
}

// ---------------------------------------------------------------------------
// Configuration, errors, telemetry
// ---------------------------------------------------------------------------

#[test]
fn profile_resolution_applies_defaults_and_overrides() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.shop]
root = "/var/foreman"
trunk = "develop"
poll_interval_secs = 0
max_cycles = 5
delivery_mode = "pull"
build_failure_routing = "all"

[[profiles.shop.features]]
name = "auth"

[[profiles.shop.features]]
name = "cart"
branch = "wip/cart"

[profiles.shop.ownership]
"STD-003" = "auth"

[profiles.shop.build]
check = "cargo check"
start = "cargo run"
smoke_grace_secs = 5

[profiles.shop.pull_request]
draft = true
"#,
    )
    .expect("write config");
    let config_path = path.display().to_string();
    let profiles = load_profiles(&config_path).expect("profiles should load");

    let mut cli = test_cli(&config_path, "shop");
    cli.max_cycles = Some(2);
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.root, PathBuf::from("/var/foreman"));
    assert_eq!(cfg.trunk, "develop");
    assert_eq!(cfg.poll_interval, Duration::from_secs(1));
    assert_eq!(cfg.max_cycles, 2);
    assert_eq!(cfg.delivery_mode, DeliveryMode::Pull);
    assert_eq!(cfg.build_failure_routing, BuildFailureRouting::All);
    assert_eq!(cfg.feature_names(), vec!["auth", "cart"]);
    assert_eq!(cfg.features[0].branch, "feature/auth");
    assert_eq!(cfg.features[1].branch, "wip/cart");
    assert_eq!(
        cfg.features[0].directory,
        PathBuf::from("/var/foreman/worktrees/auth")
    );
    assert_eq!(cfg.known_agents(), vec!["auth", "cart", "qa"]);
    assert_eq!(cfg.ownership.get("STD-003").map(String::as_str), Some("auth"));
    assert_eq!(cfg.build.check.as_deref(), Some("cargo check"));
    assert_eq!(cfg.build.smoke_grace, Duration::from_secs(5));
    assert!(cfg.pull_request.draft);
    assert_eq!(cfg.pull_request.supported_hosts, vec!["github.com"]);
}

#[test]
fn profile_validation_rejects_bad_features_and_ownership() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");

    std::fs::write(
        &path,
        "[profiles.p]\n[[profiles.p.features]]\nname = \"auth\"\n\
         [profiles.p.ownership]\n\"STD-003\" = \"billing\"\n",
    )
    .expect("write config");
    let profiles = load_profiles(&path.display().to_string()).expect("profiles should load");
    let err = resolve_runtime_config(&test_cli(&path.display().to_string(), "p"), &profiles)
        .expect_err("ownership must point at a registered feature");
    assert!(err.to_string().contains("billing"));

    std::fs::write(
        &path,
        "[profiles.p]\n[[profiles.p.features]]\nname = \"qa\"\n",
    )
    .expect("write config");
    let profiles = load_profiles(&path.display().to_string()).expect("profiles should load");
    resolve_runtime_config(&test_cli(&path.display().to_string(), "p"), &profiles)
        .expect_err("the qa agent id is reserved");

    std::fs::write(&path, "[profiles.p]\nunknown_key = 1\n").expect("write config");
    assert!(load_profiles(&path.display().to_string()).is_err());
}

#[test]
fn missing_profile_lists_available_names() {
    let profiles = ProfilesFile::default();
    let err = resolve_runtime_config(&test_cli("missing.toml", "prod"), &profiles)
        .expect_err("missing profile should fail");
    assert!(err.to_string().contains("No profiles are defined yet"));
    assert_eq!(categorize_error(&err), ErrorCategory::Config);
    assert!(format_cli_error(&err).starts_with("[CONFIG]"));
}

#[test]
fn telemetry_summary_traces_each_supervisor_run() {
    let lines = vec![
        r#"{"ts_unix_ms":1,"event":"phase.entered","phase":"MERGE","cycle":1,"run_id":"r1"}"#
            .to_string(),
        r#"{"ts_unix_ms":2,"event":"qa.signalled","cycle":1,"run_id":"r1"}"#.to_string(),
        r#"{"ts_unix_ms":3,"event":"fix.assigned","cycle":1,"run_id":"r1"}"#.to_string(),
        r#"{"ts_unix_ms":4,"event":"run.escalated","cycles":3,"run_id":"r1"}"#.to_string(),
        r#"{"ts_unix_ms":5,"event":"phase.entered","phase":"WAIT_QA","cycle":1,"run_id":"r2"}"#
            .to_string(),
        "not json".to_string(),
    ];
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.parsed_events, 5);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.phase_counts.get("MERGE"), Some(&1));
    assert_eq!(summary.qa_signalled(), 1);
    assert_eq!(summary.fixes_assigned(), 1);
    assert_eq!(summary.runs_ended(RunEnd::Escalated), 1);
    assert_eq!(summary.last_event_ts_unix_ms, Some(5));

    let escalated = &summary.runs["r1"];
    assert_eq!(escalated.cycles, 3);
    assert_eq!(escalated.end, Some(RunEnd::Escalated));
    let open = &summary.runs["r2"];
    assert_eq!(open.end, None);
    assert_eq!(open.last_phase.as_deref(), Some("WAIT_QA"));
}

#[test]
fn telemetry_summary_keeps_only_the_newest_lines() {
    let lines = (1..=4)
        .map(|n| format!(r#"{{"ts_unix_ms":{n},"event":"qa.signalled","run_id":"r{n}"}}"#))
        .collect::<Vec<_>>();
    let summary = summarize_telemetry_lines(lines, 2);
    assert_eq!(summary.parsed_events, 2);
    assert!(summary.runs.contains_key("r4"));
    assert!(!summary.runs.contains_key("r1"));
}

#[tokio::test]
async fn supervisor_run_is_traced_under_one_run_id() {
    let mut h = harness(&["auth"]);
    h.cfg.telemetry_enabled = true;
    h.complete_all();
    let qa = h.spawn_qa(Vec::new(), vec![passing("STD-001")]);
    let sink = TelemetrySink::new(&h.cfg);
    let run_id = sink.run_id.clone();
    let mut supervisor = Supervisor::new(
        h.cfg.clone(),
        h.bus.clone(),
        h.gate.clone(),
        h.merger.clone(),
        Arc::new(FakePublisher::returning(PrOutcome::Skipped {
            reason: "disabled".to_string(),
        })),
        sink,
    )
    .expect("supervisor should build");
    let outcome = run_to_end(&mut supervisor).await;
    assert!(matches!(outcome, RunOutcome::Complete { cycles: 1, .. }));
    qa.await.expect("qa task");

    let content = std::fs::read_to_string(&h.cfg.telemetry_path).expect("telemetry file");
    let lines = content.lines().map(str::to_string).collect::<Vec<_>>();
    let summary = summarize_telemetry_lines(lines, 1000);
    assert_eq!(summary.parse_errors, 0);
    assert_eq!(summary.runs.len(), 1);
    let run = &summary.runs[&run_id];
    assert_eq!(run.end, Some(RunEnd::Completed));
    assert_eq!(run.qa_signals, 1);
    assert_eq!(run.fixes, 0);
    assert_eq!(summary.phase_counts.get("MERGE"), Some(&1));
}

#[test]
fn failure_kinds_distinguish_recoverable_failures() {
    assert!(FailureKind::QaFailure.is_recoverable());
    assert!(FailureKind::BuildVerificationFailure.is_recoverable());
    assert!(!FailureKind::ScaffoldFailure.is_recoverable());
    assert!(!FailureKind::MergeConflict.is_recoverable());
    assert_eq!(FailureKind::MergeConflict.to_string(), "MERGE_CONFLICT");
}
