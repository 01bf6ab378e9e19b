//! Integration tests for the runner loop.
//!
//! Each test builds a working directory in a tempdir, drops job directories
//! into the pending namespace the way the commander does, runs the real loop
//! against `/bin/sh` scripts and inspects the published bundles.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use scan_runner::bundle::{self, ArtifactKind, BundleManifest, CANCELLED_CODE, NOT_STARTED_CODE, TIMED_OUT_CODE};
use scan_runner::config::RunnerConfig;
use scan_runner::error::{ClaimFailed, Result};
use scan_runner::job::{JobId, JobState};
use scan_runner::store::{FsJobStore, JobStore};
use scan_runner::worker::{OutputCollector, RunSummary, RunnerLoop};

/// Maximum time any wait is allowed before we consider the runner hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

struct Harness {
    tmp: TempDir,
    config: RunnerConfig,
}

impl Harness {
    fn new(slots: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = RunnerConfig::for_root(tmp.path())
            .with_poll_interval(Duration::from_millis(50))
            .with_slots(slots)
            .with_job_timeout(Duration::from_secs(30))
            .with_grace_period(Duration::from_secs(1))
            .with_drain_timeout(Duration::from_secs(2));
        config.ensure_dirs().unwrap();
        Self { tmp, config }
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn store(&self) -> FsJobStore {
        FsJobStore::new(self.config.pending_dir.clone(), self.config.staging_dir.clone())
    }

    /// Drop a job that runs `script` through `sh`, then mark it ready.
    fn add_job(&self, id: &str, script: &str, descriptor: serde_json::Value) -> PathBuf {
        let dir = self.config.pending_dir.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), script).unwrap();
        let mut descriptor = descriptor;
        descriptor["command"] = json!("sh");
        descriptor["args"] = json!(["run.sh"]);
        std::fs::write(dir.join("job.json"), descriptor.to_string()).unwrap();
        std::fs::write(dir.join(".ready"), "").unwrap();
        dir
    }

    fn done(&self, id: &str) -> PathBuf {
        self.config.done_dir.join(id)
    }

    fn staged(&self, id: &str) -> PathBuf {
        self.config.staging_dir.join(id)
    }

    fn start(&self) -> (CancellationToken, JoinHandle<Result<RunSummary>>) {
        let shutdown = CancellationToken::new();
        let runner = RunnerLoop::new(self.config.clone(), Arc::new(self.store()));
        let handle = tokio::spawn(runner.run(shutdown.clone()));
        (shutdown, handle)
    }
}

/// Poll until `path` exists.
async fn wait_for(path: &Path) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", path.display()));
}

async fn published(dir: &Path) -> BundleManifest {
    wait_for(&dir.join(bundle::MANIFEST_FILE)).await;
    bundle::read_manifest(dir).await.unwrap().unwrap()
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<Result<RunSummary>>) -> RunSummary {
    shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("runner did not stop")
        .unwrap()
        .unwrap()
}

fn read_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

fn process_gone(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None::<Signal>) == Err(Errno::ESRCH) {
        return true;
    }
    // A killed orphan stays a zombie until init reaps it.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
        .unwrap_or(true)
}

/// Poll until `pid` is gone, giving init time to reap reparented processes.
async fn eventually_gone(pid: i32) -> bool {
    for _ in 0..40 {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll until `path` no longer exists.
async fn wait_for_removal(path: &Path) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} was never removed", path.display()));
}

#[tokio::test]
async fn successful_scan_publishes_declared_output() {
    let h = Harness::new(2);
    h.add_job(
        "def456",
        "echo scanning\necho '<report/>' > report.xml\n",
        json!({"expected_outputs": ["report.xml"]}),
    );
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("def456")).await;
    assert_eq!(manifest.state, JobState::Completed);
    assert_eq!(manifest.exit_status, 0);
    assert!(manifest.output_complete);
    assert!(manifest.missing_outputs.is_empty());

    let stdout = manifest.artifact("job.out").unwrap();
    assert_eq!(stdout.kind, ArtifactKind::Stdout);
    assert_eq!(stdout.size, "scanning\n".len() as u64);
    let report = manifest.artifact("report.xml").unwrap();
    assert_eq!(report.kind, ArtifactKind::Declared);

    let done = h.done("def456");
    assert_eq!(std::fs::read_to_string(done.join(".done")).unwrap(), "0\n");
    assert_eq!(std::fs::read_to_string(done.join("job.out")).unwrap(), "scanning\n");
    assert!(!done.join(".ready").exists());
    assert!(!h.config.pending_dir.join("def456").exists());
    assert!(!h.staged("def456").exists());

    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.published, 1);
}

#[tokio::test]
async fn timeout_terminates_tool_and_publishes() {
    let h = Harness::new(1);
    h.add_job("abc123", "echo $$ > tool.pid\nsleep 10\n", json!({"timeout_secs": 1}));
    let started = std::time::Instant::now();
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("abc123")).await;
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(manifest.state, JobState::TimedOut);
    assert_eq!(manifest.exit_status, TIMED_OUT_CODE);
    assert_eq!(
        std::fs::read_to_string(h.done("abc123").join(".done")).unwrap(),
        format!("{TIMED_OUT_CODE}\n")
    );
    assert!(process_gone(read_pid(&h.done("abc123").join("tool.pid"))));

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn tool_ignoring_sigterm_is_killed_after_grace() {
    let h = Harness::new(1);
    h.add_job(
        "stubborn",
        "trap '' TERM\necho $$ > tool.pid\nwhile :; do sleep 0.1; done\n",
        json!({"timeout_secs": 1}),
    );
    let started = std::time::Instant::now();
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("stubborn")).await;
    let elapsed = started.elapsed();
    // Timeout of 1s plus the harness grace period of 1s.
    assert!(elapsed >= Duration::from_secs(2), "published after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "published after {elapsed:?}");
    assert_eq!(manifest.state, JobState::TimedOut);
    assert_eq!(manifest.exit_status, TIMED_OUT_CODE);
    assert!(manifest.output_complete);
    assert!(process_gone(read_pid(&h.done("stubborn").join("tool.pid"))));

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn huge_descriptor_timeout_still_runs() {
    let h = Harness::new(1);
    h.add_job("patient", "echo hi\n", json!({"timeout_secs": u64::MAX}));
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("patient")).await;
    assert_eq!(manifest.state, JobState::Completed);
    assert_eq!(manifest.exit_status, 0);
    assert_eq!(
        std::fs::read_to_string(h.done("patient").join("job.out")).unwrap(),
        "hi\n"
    );

    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.published, 1);
}

#[tokio::test]
async fn leftover_group_members_are_killed_after_exit() {
    let h = Harness::new(1);
    h.add_job("leaky", "sleep 30 &\necho $! > bg.pid\nexit 0\n", json!({}));
    let started = std::time::Instant::now();
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("leaky")).await;
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(manifest.state, JobState::Completed);
    assert!(manifest.output_complete);
    assert!(eventually_gone(read_pid(&h.done("leaky").join("bg.pid"))).await);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn pipe_held_outside_the_group_abandons_drain() {
    let mut h = Harness::new(1);
    h.config.drain_timeout = Duration::from_millis(300);
    // `setsid` moves the sleeper out of the job's process group, so the
    // group kill after exit cannot close its copy of stdout.
    h.add_job(
        "holder",
        "setsid sleep 20 &\necho $! > holder.pid\necho finished\n",
        json!({}),
    );
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("holder")).await;
    let holder = read_pid(&h.done("holder").join("holder.pid"));
    let _ = kill(Pid::from_raw(holder), Signal::SIGKILL);

    assert_eq!(manifest.state, JobState::Completed);
    assert!(!manifest.output_complete);
    assert!(manifest.artifact("job.out").is_some());

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn dot_prefixed_output_is_listed_once() {
    let h = Harness::new(1);
    h.add_job(
        "dotted",
        "echo '<report/>' > report.xml\n",
        json!({"expected_outputs": ["./report.xml"]}),
    );
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("dotted")).await;
    assert_eq!(manifest.state, JobState::Completed);
    let reports: Vec<_> = manifest
        .artifacts
        .iter()
        .filter(|a| a.path == "report.xml")
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ArtifactKind::Declared);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn invalid_executable_publishes_failed_bundle() {
    let h = Harness::new(1);
    let dir = h.config.pending_dir.join("ghi789");
    std::fs::create_dir_all(&dir).unwrap();
    // Default `job` file with no interpreter line and no binary format.
    std::fs::write(dir.join("job"), "this is not a program\n").unwrap();
    std::fs::write(dir.join(".ready"), "").unwrap();
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("ghi789")).await;
    assert_eq!(manifest.state, JobState::Failed);
    assert_eq!(manifest.exit_status, NOT_STARTED_CODE);
    assert!(manifest.artifacts.is_empty());
    assert!(manifest.error.is_some());
    assert!(!h.done("ghi789").join("job.out").exists());

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn invalid_descriptor_publishes_failed_bundle() {
    let h = Harness::new(1);
    let dir = h.config.pending_dir.join("badjson");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("job.json"), r#"{"command": "sh", "retries": 3}"#).unwrap();
    std::fs::write(dir.join(".ready"), "").unwrap();
    let (shutdown, handle) = h.start();

    let manifest = published(&h.done("badjson")).await;
    assert_eq!(manifest.state, JobState::Failed);
    assert_eq!(manifest.exit_status, NOT_STARTED_CODE);
    assert!(manifest.started_at.is_none());

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn nonzero_exit_and_missing_output_fail() {
    let h = Harness::new(2);
    h.add_job("exit3", "echo oops >&2\nexit 3\n", json!({}));
    h.add_job("noreport", "true\n", json!({"expected_outputs": ["report.xml"]}));
    let (shutdown, handle) = h.start();

    let exit3 = published(&h.done("exit3")).await;
    assert_eq!(exit3.state, JobState::Failed);
    assert_eq!(exit3.exit_status, 3);
    assert_eq!(exit3.artifact("job.err").unwrap().size, "oops\n".len() as u64);

    let noreport = published(&h.done("noreport")).await;
    assert_eq!(noreport.state, JobState::Failed);
    assert_eq!(noreport.exit_status, 0);
    assert_eq!(noreport.missing_outputs, vec!["report.xml".to_string()]);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn duplicate_destination_keeps_bundle_in_staging() {
    let h = Harness::new(1);
    let existing = h.done("abc123");
    std::fs::create_dir_all(&existing).unwrap();
    std::fs::write(existing.join("marker"), "older bundle").unwrap();
    h.add_job("abc123", "echo again\n", json!({}));
    let (shutdown, handle) = h.start();

    let manifest = published(&h.staged("abc123")).await;
    assert_eq!(manifest.state, JobState::Completed);

    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.retained, 1);
    assert_eq!(summary.published, 0);
    assert_eq!(
        std::fs::read_to_string(existing.join("marker")).unwrap(),
        "older bundle"
    );
    assert!(!existing.join(bundle::MANIFEST_FILE).exists());
    assert_eq!(
        std::fs::read_to_string(h.staged("abc123").join("job.out")).unwrap(),
        "again\n"
    );
}

#[tokio::test]
async fn shutdown_cancels_running_job_without_orphans() {
    let h = Harness::new(1);
    h.add_job("long1", "echo $$ > tool.pid\nsleep 30 &\nwait\n", json!({}));
    let (shutdown, handle) = h.start();

    let pid_file = h.staged("long1").join("tool.pid");
    wait_for(&pid_file).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pid = read_pid(&pid_file);

    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.published, 1);

    let manifest = bundle::read_manifest(&h.done("long1")).await.unwrap().unwrap();
    assert_eq!(manifest.state, JobState::Cancelled);
    assert_eq!(manifest.exit_status, CANCELLED_CODE);
    assert!(process_gone(pid));
}

#[tokio::test]
async fn abort_request_cancels_one_job() {
    let h = Harness::new(2);
    h.add_job("victim", "echo $$ > tool.pid\nsleep 30\n", json!({}));
    h.add_job("bystander", "sleep 1\necho ok\n", json!({}));
    let (shutdown, handle) = h.start();

    wait_for(&h.staged("victim").join("tool.pid")).await;
    std::fs::write(h.config.pending_dir.join("victim.abort"), "").unwrap();

    let victim = published(&h.done("victim")).await;
    assert_eq!(victim.state, JobState::Cancelled);
    assert!(!h.config.pending_dir.join("victim.abort").exists());

    let bystander = published(&h.done("bystander")).await;
    assert_eq!(bystander.state, JobState::Completed);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn abort_request_for_queued_job_skips_the_tool() {
    let h = Harness::new(1);
    h.add_job("blocker", "echo $$ > tool.pid\nsleep 1\n", json!({}));
    h.add_job("queued", "touch ran\n", json!({}));
    let (shutdown, handle) = h.start();

    wait_for(&h.staged("blocker").join("tool.pid")).await;
    let marker = h.config.pending_dir.join("queued.abort");
    std::fs::write(&marker, "").unwrap();
    let ghost = h.config.pending_dir.join("ghost.abort");
    std::fs::write(&ghost, "").unwrap();
    wait_for_removal(&ghost).await;
    // Still queued behind the blocker, so the request waits.
    assert!(marker.exists());

    let queued = published(&h.done("queued")).await;
    assert_eq!(queued.state, JobState::Cancelled);
    assert_eq!(queued.exit_status, CANCELLED_CODE);
    assert!(queued.started_at.is_none());
    assert!(!h.done("queued").join("ran").exists());
    assert!(!marker.exists());

    let blocker = published(&h.done("blocker")).await;
    assert_eq!(blocker.state, JobState::Completed);

    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.dispatched, 2);
}

#[tokio::test]
async fn single_slot_runs_jobs_one_at_a_time() {
    let h = Harness::new(1);
    let log = h.root().join("order.log");
    for id in ["first", "second"] {
        h.add_job(
            id,
            &format!(
                "echo start >> {log}\nsleep 0.3\necho end >> {log}\n",
                log = log.display()
            ),
            json!({}),
        );
    }
    let (shutdown, handle) = h.start();

    published(&h.done("first")).await;
    published(&h.done("second")).await;
    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.dispatched, 2);

    let order = std::fs::read_to_string(&log).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), ["start", "end", "start", "end"]);
}

#[tokio::test]
async fn jobs_without_ready_marker_are_left_alone() {
    let h = Harness::new(1);
    let dir = h.add_job("early", "true\n", json!({}));
    std::fs::remove_file(dir.join(".ready")).unwrap();
    let (shutdown, handle) = h.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.dispatched, 0);
    assert!(dir.join("run.sh").exists());
}

#[tokio::test]
async fn startup_recovers_staged_jobs() {
    let h = Harness::new(1);

    // Finished before the crash, never published.
    let finished = h.staged("finished");
    std::fs::create_dir_all(&finished).unwrap();
    let mut job = h.store().load_staged(&JobId::parse("finished").unwrap()).await.unwrap();
    OutputCollector::stage_failure(&mut job, "earlier failure".into())
        .await
        .unwrap();

    // Claimed and running when the runner died.
    let interrupted = h.staged("interrupted");
    std::fs::create_dir_all(&interrupted).unwrap();
    std::fs::write(interrupted.join("job"), "#!/bin/sh\nsleep 100\n").unwrap();

    let (shutdown, handle) = h.start();
    let earlier = published(&h.done("finished")).await;
    assert_eq!(earlier.error.as_deref(), Some("earlier failure"));
    let recovered = published(&h.done("interrupted")).await;
    assert_eq!(recovered.state, JobState::Failed);
    assert_eq!(recovered.exit_status, NOT_STARTED_CODE);

    let summary = stop(shutdown, handle).await;
    assert_eq!(summary.recovered, 2);
    assert_eq!(summary.dispatched, 0);
    assert!(std::fs::read_dir(&h.config.staging_dir).unwrap().next().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let h = Harness::new(1);
    h.add_job("contested", "true\n", json!({}));
    let id = JobId::parse("contested").unwrap();
    let (a, b) = (h.store(), h.store());

    let (first, second) = tokio::join!(a.claim(&id), b.claim(&id));
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(ClaimFailed::Vanished { .. } | ClaimFailed::AlreadyStaged { .. })
    )));
    assert!(h.staged("contested").join("run.sh").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn published_bundle_is_never_partial() {
    let h = Harness::new(1);
    let staged = h.staged("big1");
    std::fs::create_dir_all(staged.join("raw")).unwrap();
    let payload = vec![b'x'; 4 * 1024 * 1024];
    for i in 0..8 {
        std::fs::write(staged.join(format!("raw/part{i}")), &payload).unwrap();
    }
    let mut job = h.store().load_staged(&JobId::parse("big1").unwrap()).await.unwrap();
    let bundle = OutputCollector::stage_failure(&mut job, "fixture".into()).await.unwrap();

    let destination = h.done("big1");
    let watcher = {
        let destination = destination.clone();
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + TEST_TIMEOUT;
            while std::time::Instant::now() < deadline {
                if destination.exists() {
                    assert!(destination.join(bundle::MANIFEST_FILE).exists());
                    for i in 0..8 {
                        let len = std::fs::metadata(destination.join(format!("raw/part{i}")))
                            .unwrap()
                            .len();
                        assert_eq!(len, 4 * 1024 * 1024);
                    }
                    return true;
                }
            }
            false
        })
    };

    let finalizer = bundle::BundleFinalizer::new(h.config.done_dir.clone());
    let published = finalizer.publish(&bundle).await.unwrap();
    assert_eq!(published.path, destination);
    assert_eq!(published.state, JobState::Failed);
    assert!(watcher.join().unwrap());
    assert!(!staged.exists());
}
