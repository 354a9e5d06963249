//! End-to-end lifecycle coverage through the public service API.
//!
//! These tests run unprivileged: isolation strategy "none", plain
//! /bin/sh as the script runner, and a temporary jobs root.

use sbx::config::Settings;
use sbx::jobs::JobService;
use sbx::types::JobStatus;
use std::time::{Duration, Instant};

fn service(jobs_root: &std::path::Path) -> JobService {
    let mut settings = Settings::default();
    settings.jobs_root = jobs_root.to_path_buf();
    settings.iso_strategy = "none".to_string();
    settings.runtimes.bash = "/bin/sh".to_string();
    JobService::new(settings).expect("service construction")
}

#[test]
fn successful_run_reaches_finished_with_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());

    let job = svc
        .submit("run.sh", b"echo hello\necho oops >&2\n", Some("bash"))
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());

    let done = svc.run(&job.id).unwrap();
    assert_eq!(done.status, JobStatus::Finished);
    assert_eq!(done.exit_code, Some(0));
    assert_eq!(done.reason, None);
    assert!(done.started_at.is_some());
    assert!(done.finished_at.is_some());
    assert!(done.finished_at >= done.started_at);

    let (stdout, stderr) = svc.logs(&job.id).unwrap();
    assert_eq!(stdout, "hello\n");
    assert_eq!(stderr, "oops\n");

    // The persisted outcome agrees with the in-memory state.
    let ws = dir.path().join(&job.id);
    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(ws.join("meta.json")).unwrap()).unwrap();
    assert_eq!(meta["status"], "FINISHED");
    assert_eq!(meta["rc"], 0);
    assert_eq!(meta["strategy"], "none");
    assert_eq!(meta["resolved_cmd"][0], "/bin/sh");
    assert!(meta["capabilities"].is_object());

    // Workspace layout: entry + streams + meta + status trail.
    for name in ["run.sh", "stdout.txt", "stderr.txt", "meta.json", "status.log"] {
        assert!(ws.join(name).is_file(), "missing {name}");
    }
}

#[test]
fn failing_script_reports_exit_reason() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());
    let job = svc.submit("run.sh", b"exit 17\n", Some("bash")).unwrap();
    let done = svc.run(&job.id).unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.exit_code, Some(17));
    assert_eq!(done.reason.as_deref(), Some("exit_17"));
}

#[test]
fn runaway_script_is_killed_at_the_wall_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.jobs_root = dir.path().to_path_buf();
    settings.iso_strategy = "none".to_string();
    settings.runtimes.bash = "/bin/sh".to_string();
    settings.limits.wall_timeout_seconds = 1;
    let svc = JobService::new(settings).unwrap();

    let job = svc
        .submit("run.sh", b"echo partial\nsleep 60\n", Some("bash"))
        .unwrap();
    let started = Instant::now();
    let done = svc.run(&job.id).unwrap();

    assert_eq!(done.status, JobStatus::Timeout);
    assert_eq!(done.exit_code, Some(-9));
    assert_eq!(done.reason.as_deref(), Some("timeout_1s"));
    assert!(started.elapsed() < Duration::from_secs(20));

    // Output up to the kill survives, and the marker is appended.
    let (stdout, stderr) = svc.logs(&job.id).unwrap();
    assert_eq!(stdout, "partial\n");
    assert!(stderr.ends_with("[timeout] exceeded 1s"));
}

#[test]
fn unknown_job_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());
    assert!(svc.run("f8b5f0a0-0000-0000-0000-000000000000").is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn submissions_are_isolated_per_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());
    let a = svc.submit("run.sh", b"echo A\n", Some("bash")).unwrap();
    let b = svc.submit("run.sh", b"echo B\n", Some("bash")).unwrap();
    assert_ne!(a.id, b.id);

    svc.run(&a.id).unwrap();
    svc.run(&b.id).unwrap();
    assert_eq!(svc.logs(&a.id).unwrap().0, "A\n");
    assert_eq!(svc.logs(&b.id).unwrap().0, "B\n");
}

#[test]
fn status_reads_a_zero_exit_code_before_any_run() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());
    let job = svc.submit("run.sh", b"true\n", Some("bash")).unwrap();
    let read = svc.status(&job.id).unwrap();
    assert_eq!(read.status, JobStatus::Queued);
    assert_eq!(read.exit_code, Some(0));
}

#[test]
fn denied_syscall_is_distinguishable_from_a_plain_failure() {
    if !sbx::seccomp::is_supported() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("deny-chdir.yaml");
    std::fs::write(&policy, "- chdir\n").unwrap();

    let mut settings = Settings::default();
    settings.jobs_root = dir.path().join("jobs");
    settings.iso_strategy = "none".to_string();
    settings.runtimes.bash = "/bin/sh".to_string();
    settings.seccomp.enabled = true;
    settings.seccomp.policy = policy;
    let svc = JobService::new(settings).unwrap();

    // `cd` issues the denied syscall; the filter kills the process with
    // SIGSYS before the echo runs.
    let job = svc
        .submit("run.sh", b"cd /\necho escaped\n", Some("bash"))
        .unwrap();
    let done = svc.run(&job.id).unwrap();
    assert_eq!(done.status, JobStatus::Killed);
    assert_eq!(done.reason.as_deref(), Some("signal_31"));
    assert_eq!(svc.logs(&job.id).unwrap().0, "");

    // The same program finishes cleanly once the filter is off.
    let svc_off = service(&dir.path().join("jobs-off"));
    let job = svc_off
        .submit("run.sh", b"cd /\necho escaped\n", Some("bash"))
        .unwrap();
    let done = svc_off.run(&job.id).unwrap();
    assert_eq!(done.status, JobStatus::Finished);
    assert_eq!(svc_off.logs(&job.id).unwrap().0, "escaped\n");
}

#[test]
fn status_trail_records_the_full_transition_history() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());
    let job = svc.submit("run.sh", b"true\n", Some("bash")).unwrap();
    svc.run(&job.id).unwrap();

    let trail = std::fs::read_to_string(dir.path().join(&job.id).join("status.log")).unwrap();
    let states: Vec<&str> = trail
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .collect();
    assert_eq!(states, vec!["QUEUED", "RUNNING", "FINISHED"]);

    // Detail column: language while pending, reason once terminal.
    let details: Vec<&str> = trail
        .lines()
        .filter_map(|l| l.split_whitespace().nth(2))
        .collect();
    assert_eq!(details, vec!["bash", "bash", "exit_0"]);
}
