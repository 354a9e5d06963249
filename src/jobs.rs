/// Job orchestration: submission, run lifecycle, status and log access.
///
/// The service owns the in-memory job table and the storage layout; the
/// execution engine is only borrowed for the duration of a run. State
/// transitions are persisted to the status trail before the action they
/// announce, so a crash mid-run leaves a RUNNING record rather than a
/// silently stale QUEUED one.
use crate::config::Settings;
use crate::executor::{build_engine, EngineOutcome, ExecutionEngine};
use crate::isolation::CapabilityProbe;
use crate::runner::Language;
use crate::storage::{RunMeta, Storage};
use crate::types::{Job, JobStatus, Result, RunResult, SbxError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub struct JobService {
    engine: ExecutionEngine,
    storage: Storage,
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobService {
    pub fn new(settings: Settings) -> Result<Self> {
        let storage = Storage::new(settings.jobs_root.clone());
        let engine = build_engine(settings)?;
        Ok(Self {
            engine,
            storage,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        self.engine.settings()
    }

    pub fn probe(&self) -> CapabilityProbe {
        CapabilityProbe::collect(self.engine.settings())
    }

    /// Accept a submission: allocate an id, persist the code into a fresh
    /// workspace, register the job as QUEUED. The language is taken from
    /// the explicit override when given, otherwise inferred from the
    /// entry extension; an unsupported override is accepted here and
    /// rejected at run time.
    pub fn submit(&self, entry: &str, code: &[u8], lang: Option<&str>) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let script_path = self.storage.create_workspace(&id, entry, code)?;

        let lang = match lang {
            Some(name) => name.to_string(),
            None => Language::infer(entry).as_str().to_string(),
        };

        let job = Job {
            id: id.clone(),
            lang,
            entry: entry.to_string(),
            status: JobStatus::Queued,
            exit_code: None,
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            workspace: self.storage.workspace(&id),
            script_path,
        };

        self.storage.log_status(&id, JobStatus::Queued, &job.lang);
        let mut jobs = self.lock_jobs();
        jobs.insert(id, job.clone());
        log::info!("job {} submitted ({} {})", job.id, job.lang, job.entry);
        Ok(job)
    }

    /// Run a job to a terminal state. Re-running from a terminal state is
    /// allowed and replaces the previous artifacts. Unknown ids fail
    /// before any isolation resource is touched.
    pub fn run(&self, job_id: &str) -> Result<Job> {
        let mut job = {
            let jobs = self.lock_jobs();
            jobs.get(job_id)
                .cloned()
                .ok_or_else(|| SbxError::Validation(format!("unknown job id {job_id:?}")))?
        };

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.exit_code = None;
        job.reason = None;
        job.finished_at = None;
        self.storage.log_status(job_id, JobStatus::Running, &job.lang);
        self.update(&job);

        let outcome = match Language::parse(&job.lang) {
            Some(lang) => self.engine.run(&job, lang),
            None => EngineOutcome {
                result: RunResult {
                    status: JobStatus::Failed,
                    rc: -1,
                    reason: Some(format!("lang_unsupported:{}", job.lang)),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_s: 0.0,
                },
                resolved_cmd: Vec::new(),
                cgroup_metrics: Default::default(),
            },
        };

        let probe = self.probe();
        let settings = self.engine.settings();
        let meta = RunMeta::from_result(
            job_id,
            &outcome.result,
            settings.resolve_limits(),
            &settings.iso_strategy,
            outcome.resolved_cmd,
            Some(&probe),
            outcome.cgroup_metrics,
        );
        self.storage.save_artifacts(job_id, &outcome.result, &meta)?;

        job.status = outcome.result.status;
        job.exit_code = Some(outcome.result.rc);
        job.reason = outcome.result.reason.clone();
        job.finished_at = Some(Utc::now());
        self.storage.log_status(
            job_id,
            job.status,
            job.reason.as_deref().unwrap_or("exit_0"),
        );
        self.update(&job);

        log::info!(
            "job {} finished: {} rc={} ({:.3}s)",
            job.id,
            job.status.as_str(),
            outcome.result.rc,
            outcome.result.duration_s
        );
        Ok(job)
    }

    /// Submit and immediately run, the one-shot path.
    pub fn exec(&self, entry: &str, code: &[u8], lang: Option<&str>) -> Result<Job> {
        let job = self.submit(entry, code, lang)?;
        self.run(&job.id)
    }

    /// Current job state. The exit code reads as 0 while absent, so
    /// status consumers never have to handle a null code.
    pub fn status(&self, job_id: &str) -> Result<Job> {
        let mut job = {
            let jobs = self.lock_jobs();
            jobs.get(job_id)
                .cloned()
                .ok_or_else(|| SbxError::Validation(format!("unknown job id {job_id:?}")))?
        };
        job.exit_code = Some(job.exit_code.unwrap_or(0));
        Ok(job)
    }

    /// Captured streams of the last run; empty strings before the first
    /// run. Unknown ids are rejected rather than read as empty.
    pub fn logs(&self, job_id: &str) -> Result<(String, String)> {
        {
            let jobs = self.lock_jobs();
            if !jobs.contains_key(job_id) {
                return Err(SbxError::Validation(format!("unknown job id {job_id:?}")));
            }
        }
        Ok(self.storage.read_logs(job_id))
    }

    fn update(&self, job: &Job) {
        let mut jobs = self.lock_jobs();
        jobs.insert(job.id.clone(), job.clone());
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        // A poisoned table only means another run panicked; the map
        // itself is still consistent (whole-value inserts).
        match self.jobs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> JobService {
        let mut settings = Settings::default();
        settings.jobs_root = dir.to_path_buf();
        settings.iso_strategy = "none".to_string();
        settings.runtimes.bash = "/bin/sh".to_string();
        JobService::new(settings).unwrap()
    }

    #[test]
    fn submissions_get_unique_ids_and_persisted_code() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let a = svc.submit("main.py", b"print(1)\n", None).unwrap();
        let b = svc.submit("main.py", b"print(2)\n", None).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.lang, "python");
        assert_eq!(std::fs::read(&a.script_path).unwrap(), b"print(1)\n");
        assert_eq!(std::fs::read(&b.script_path).unwrap(), b"print(2)\n");
    }

    #[test]
    fn unknown_id_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(matches!(
            svc.run("no-such-id"),
            Err(SbxError::Validation(_))
        ));
        assert!(matches!(
            svc.status("no-such-id"),
            Err(SbxError::Validation(_))
        ));
        assert!(matches!(
            svc.logs("no-such-id"),
            Err(SbxError::Validation(_))
        ));
        // No stray workspace appeared.
        assert!(!dir.path().join("no-such-id").exists());
    }

    #[test]
    fn unsupported_language_fails_fast_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let job = svc.submit("main.cob", b"", Some("cobol")).unwrap();
        let done = svc.run(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.reason.as_deref(), Some("lang_unsupported:cobol"));
        // meta.json is still valid JSON on the early-failure path.
        let meta = svc
            .status(&job.id)
            .and_then(|j| {
                let text =
                    std::fs::read_to_string(j.workspace.join("meta.json")).map_err(SbxError::from)?;
                serde_json::from_str::<serde_json::Value>(&text)
                    .map_err(|e| SbxError::Process(e.to_string()))
            })
            .unwrap();
        assert_eq!(meta["reason"], "lang_unsupported:cobol");
    }

    #[test]
    fn rerun_replaces_previous_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let job = svc.submit("run.sh", b"exit 2\n", Some("bash")).unwrap();

        let first = svc.run(&job.id).unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.exit_code, Some(2));

        std::fs::write(&job.script_path, b"echo fixed\n").unwrap();
        let second = svc.run(&job.id).unwrap();
        assert_eq!(second.status, JobStatus::Finished);
        assert_eq!(second.exit_code, Some(0));
        let (out, _) = svc.logs(&job.id).unwrap();
        assert_eq!(out, "fixed\n");
    }
}
