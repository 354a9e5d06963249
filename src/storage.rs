/// Filesystem layout and artifact persistence.
///
/// One directory per job under the jobs root:
///
///   jobs/<id>/<entry>       submitted code, written once at submission
///   jobs/<id>/stdout.txt    captured stdout of the last run
///   jobs/<id>/stderr.txt    captured stderr of the last run
///   jobs/<id>/meta.json     machine-readable outcome of the last run
///   jobs/<id>/status.log    append-only status transition trail
///
/// meta.json is written on every run path, including early failures, so
/// an observer never finds a finished workspace without a parseable
/// outcome.
use crate::isolation::CapabilityProbe;
use crate::types::{JobStatus, Limits, Result, RunResult, SbxError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";
const META_FILE: &str = "meta.json";
const STATUS_LOG: &str = "status.log";

/// Persisted outcome of one run. The superset of `RunResult` that also
/// records what containment was actually applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunMeta {
    pub job_id: String,
    pub status: JobStatus,
    pub rc: i32,
    pub reason: Option<String>,
    pub duration_s: f64,
    pub limits: Limits,
    pub strategy: String,
    /// Final argv after isolation wrapping, for reproducing a run by hand.
    pub resolved_cmd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<serde_json::Value>,
    /// Cgroup accounting snapshot taken before teardown; empty when the
    /// cgroup layer was inactive.
    #[serde(default)]
    pub cgroup_metrics: BTreeMap<String, String>,
}

/// Handle to the jobs root. Cheap to clone; all methods are keyed by
/// job id and touch only that job's directory.
#[derive(Clone, Debug)]
pub struct Storage {
    jobs_root: PathBuf,
}

impl Storage {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
        }
    }

    pub fn workspace(&self, job_id: &str) -> PathBuf {
        self.jobs_root.join(job_id)
    }

    /// Create the per-job workspace and persist the submitted code
    /// byte-for-byte. Rejects entry names that could escape the
    /// workspace.
    pub fn create_workspace(&self, job_id: &str, entry: &str, code: &[u8]) -> Result<PathBuf> {
        validate_entry(entry)?;
        let ws = self.workspace(job_id);
        fs::create_dir_all(&ws)?;
        let script = ws.join(entry);
        fs::write(&script, code)?;
        Ok(script)
    }

    /// Persist the captured streams and the run outcome. Streams are
    /// whole-file overwrites; re-runs replace the previous artifacts.
    pub fn save_artifacts(&self, job_id: &str, result: &RunResult, meta: &RunMeta) -> Result<()> {
        let ws = self.workspace(job_id);
        fs::create_dir_all(&ws)?;
        fs::write(ws.join(STDOUT_FILE), &result.stdout)?;
        fs::write(ws.join(STDERR_FILE), &result.stderr)?;
        self.save_meta(job_id, meta)
    }

    /// Write meta.json alone. Used by early-failure paths that have no
    /// streams to persist.
    pub fn save_meta(&self, job_id: &str, meta: &RunMeta) -> Result<()> {
        let ws = self.workspace(job_id);
        fs::create_dir_all(&ws)?;
        let text = serde_json::to_string_pretty(meta)
            .map_err(|e| SbxError::Process(format!("failed to encode meta.json: {e}")))?;
        fs::write(ws.join(META_FILE), text)?;
        Ok(())
    }

    pub fn load_meta(&self, job_id: &str) -> Result<RunMeta> {
        let path = self.workspace(job_id).join(META_FILE);
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| SbxError::Process(format!("corrupt {}: {e}", path.display())))
    }

    /// Read back the captured streams. A job that has not run yet (or
    /// whose run never produced streams) reads as empty, not as an error.
    pub fn read_logs(&self, job_id: &str) -> (String, String) {
        let ws = self.workspace(job_id);
        let read = |name: &str| fs::read_to_string(ws.join(name)).unwrap_or_default();
        (read(STDOUT_FILE), read(STDERR_FILE))
    }

    /// Append one status transition to the job's trail. Failures are
    /// logged and swallowed: the trail is diagnostics, never a reason to
    /// fail a run.
    pub fn log_status(&self, job_id: &str, status: JobStatus, detail: &str) {
        let ws = self.workspace(job_id);
        let line = format!("{} {} {detail}\n", Utc::now().to_rfc3339(), status.as_str());
        let appended = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(ws.join(STATUS_LOG))
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = appended {
            log::debug!("status trail append failed for {job_id}: {e}");
        }
    }
}

impl RunMeta {
    pub fn from_result(
        job_id: &str,
        result: &RunResult,
        limits: Limits,
        strategy: &str,
        resolved_cmd: Vec<String>,
        probe: Option<&CapabilityProbe>,
        cgroup_metrics: BTreeMap<String, String>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: result.status,
            rc: result.rc,
            reason: result.reason.clone(),
            duration_s: result.duration_s,
            limits,
            strategy: strategy.to_string(),
            resolved_cmd,
            capabilities: probe.and_then(|p| serde_json::to_value(p).ok()),
            cgroup_metrics,
        }
    }
}

/// Entry names are plain file names inside the workspace: no separators,
/// no parent references, nothing hidden.
fn validate_entry(entry: &str) -> Result<()> {
    let ok = !entry.is_empty()
        && !entry.starts_with('.')
        && !entry.contains('/')
        && !entry.contains('\\')
        && Path::new(entry).file_name().map(|n| n == entry).unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(SbxError::Validation(format!("invalid entry name {entry:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        (dir, storage)
    }

    #[test]
    fn workspace_persists_code_byte_identical() {
        let (_dir, s) = storage();
        let code = b"print('hi')\n\xf0\x9f\x90\x8d";
        let script = s.create_workspace("job-1", "main.py", code).unwrap();
        assert_eq!(fs::read(script).unwrap(), code);
    }

    #[test]
    fn traversal_entry_names_are_rejected() {
        let (_dir, s) = storage();
        for bad in ["../evil.py", "a/b.py", ".hidden", "", "..", "a\\b"] {
            assert!(
                s.create_workspace("job-2", bad, b"x").is_err(),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn logs_read_empty_before_any_run() {
        let (_dir, s) = storage();
        s.create_workspace("job-3", "main.py", b"").unwrap();
        let (out, err) = s.read_logs("job-3");
        assert!(out.is_empty());
        assert!(err.is_empty());
    }

    #[test]
    fn meta_roundtrips_through_disk() {
        let (_dir, s) = storage();
        let result = RunResult {
            status: JobStatus::Finished,
            rc: 0,
            reason: None,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            duration_s: 0.12,
        };
        let meta = RunMeta::from_result(
            "job-4",
            &result,
            Limits::default(),
            "none",
            vec!["python3".to_string(), "main.py".to_string()],
            None,
            BTreeMap::new(),
        );
        s.save_artifacts("job-4", &result, &meta).unwrap();

        let back = s.load_meta("job-4").unwrap();
        assert_eq!(back.status, JobStatus::Finished);
        assert_eq!(back.rc, 0);
        assert_eq!(back.resolved_cmd, meta.resolved_cmd);
        let (out, _) = s.read_logs("job-4");
        assert_eq!(out, "ok\n");
    }

    #[test]
    fn status_trail_appends_transitions() {
        let (_dir, s) = storage();
        s.create_workspace("job-5", "main.py", b"").unwrap();
        s.log_status("job-5", JobStatus::Running, "started");
        s.log_status("job-5", JobStatus::Finished, "exit_0");
        let trail = fs::read_to_string(s.workspace("job-5").join("status.log")).unwrap();
        let lines: Vec<&str> = trail.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" RUNNING "));
        assert!(lines[1].contains(" FINISHED exit_0"));
    }
}
