/// Execution engine: runs one prepared job under the configured isolation
/// layers and classifies the outcome.
///
/// Layer order around the child process:
///
///   parent: cgroup leaf created + limits verified
///   spawn:  setsid, rlimits, no_new_privs + seccomp filter (pre-exec)
///   parent: pid attached to the leaf immediately after spawn
///   ...run, bounded by the wall-clock deadline...
///   parent: metrics snapshot, then unconditional leaf teardown
///
/// All launch failures fold into a FAILED result with a
/// `runner_error:<detail>` reason; the engine itself returns an outcome
/// on every path so the orchestrator always has something to persist.
use crate::cgroup::{CgroupLeaf, CgroupService};
use crate::config::Settings;
use crate::runner::Language;
use crate::types::{Job, JobStatus, Limits, Result, RunResult, SbxError};
use crate::{isolation, rlimits, seccomp};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Return-code sentinel for the timeout kill path.
const TIMEOUT_RC: i32 = -9;

/// Poll interval for the wait loop. Coarse on purpose: the deadline has
/// second granularity.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Grace period for draining captured output once the child has been
/// reaped. A descendant that escaped the process group can keep the
/// pipes open indefinitely; past the grace the stream is cut and the run
/// proceeds with the partial capture.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// PATH visible inside the sandbox. Fixed allowlist, never inherited.
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Everything the orchestrator needs to persist about one run attempt.
#[derive(Debug)]
pub struct EngineOutcome {
    pub result: RunResult,
    pub resolved_cmd: Vec<String>,
    pub cgroup_metrics: BTreeMap<String, String>,
}

pub struct ExecutionEngine {
    settings: Settings,
    cgroups: Option<CgroupService>,
}

impl ExecutionEngine {
    /// Build the engine, initializing the cgroup base node when the
    /// strategy asks for it. Base initialization failure is fatal here,
    /// at service start, not per job.
    pub fn new(settings: Settings) -> Result<Self> {
        let cgroups = if settings.strategy_has("cgroups") {
            Some(CgroupService::init(settings.cgroup_base.as_deref())?)
        } else {
            None
        };
        Ok(Self { settings, cgroups })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one job to completion. Never panics, never returns Err: every
    /// failure mode becomes a classified outcome.
    pub fn run(&self, job: &Job, lang: Language) -> EngineOutcome {
        let start = Instant::now();
        let limits = self.settings.resolve_limits();

        let base_cmd = lang.build_command(&self.settings.runtimes, &job.entry);
        let argv = isolation::compose(&self.settings, &job.workspace, base_cmd);

        let filter = match self.compile_filter() {
            Ok(f) => f,
            Err(e) => {
                return EngineOutcome {
                    result: RunResult::runner_error(e, start.elapsed().as_secs_f64()),
                    resolved_cmd: argv,
                    cgroup_metrics: BTreeMap::new(),
                }
            }
        };

        let leaf = match self.prepare_leaf(&job.id, &limits) {
            Ok(l) => l,
            Err(e) => {
                return EngineOutcome {
                    result: RunResult::runner_error(e, start.elapsed().as_secs_f64()),
                    resolved_cmd: argv,
                    cgroup_metrics: BTreeMap::new(),
                }
            }
        };

        let result = self.spawn_and_wait(job, &argv, &limits, filter, leaf.as_ref(), start);

        let cgroup_metrics = leaf
            .as_ref()
            .map(|l| l.read_metrics())
            .unwrap_or_default();
        if let Some(l) = leaf {
            l.teardown();
        }

        EngineOutcome {
            result,
            resolved_cmd: argv,
            cgroup_metrics,
        }
    }

    /// Compile the seccomp policy in the parent so the pre-exec hook only
    /// has to install a finished program. Enabled-but-unsupported is a
    /// visible degradation, not an error.
    fn compile_filter(&self) -> Result<Option<Vec<libc::sock_filter>>> {
        if !self.settings.seccomp.enabled {
            return Ok(None);
        }
        if !seccomp::is_supported() {
            log::warn!("seccomp enabled but unsupported by the kernel; running unenforced");
            return Ok(None);
        }
        let policy = seccomp::SyscallPolicy::from_path(&self.settings.seccomp.policy)?;
        Ok(Some(policy.compile()?))
    }

    fn prepare_leaf(&self, job_id: &str, limits: &Limits) -> Result<Option<CgroupLeaf>> {
        let Some(service) = &self.cgroups else {
            return Ok(None);
        };
        let leaf = service.create_leaf(job_id)?;
        if let Err(e) = leaf.set_limits(limits) {
            // A leaf with unverified limits must not host a process.
            leaf.teardown();
            return Err(e);
        }
        Ok(Some(leaf))
    }

    fn spawn_and_wait(
        &self,
        job: &Job,
        argv: &[String],
        limits: &Limits,
        filter: Option<Vec<libc::sock_filter>>,
        leaf: Option<&CgroupLeaf>,
        start: Instant,
    ) -> RunResult {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&job.workspace)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &job.workspace)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(l) = Language::parse(&job.lang) {
            for (k, v) in l.env() {
                command.env(k, v);
            }
        }

        let child_limits = *limits;
        unsafe {
            command.pre_exec(move || {
                // Own process group so the timeout kill reaps descendants.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                rlimits::apply_rlimits(&child_limits);
                if let Some(prog) = &filter {
                    seccomp::install_filter(prog)?;
                }
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return RunResult::runner_error(
                    format!("spawn {:?}: {e}", argv[0]),
                    start.elapsed().as_secs_f64(),
                )
            }
        };
        let pid = child.id();

        // Attach before the child can fork: from here the kernel contains
        // the whole tree. An attach failure means containment is absent,
        // so the run is aborted rather than continued unbounded.
        if let Some(l) = leaf {
            if let Err(e) = l.attach(pid) {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                let _ = child.wait();
                return RunResult::runner_error(e, start.elapsed().as_secs_f64());
            }
        }
        log::debug!("job {} running as pid {pid}", job.id);

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = start + Duration::from_secs(limits.wall_timeout_seconds);
        let mut timed_out = false;
        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        timed_out = true;
                        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                        // Reap; SIGKILL is not maskable, this returns.
                        break child.wait().ok();
                    }
                    std::thread::sleep(WAIT_POLL);
                }
                Err(e) => {
                    log::warn!("wait on pid {pid} failed: {e}");
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    break child.wait().ok();
                }
            }
        };

        let drain_deadline = Instant::now() + DRAIN_GRACE;
        let stdout = drain(stdout_reader, drain_deadline);
        let mut stderr = drain(stderr_reader, drain_deadline);
        let duration_s = start.elapsed().as_secs_f64();

        if timed_out {
            stderr.push_str(&format!(
                "\n[timeout] exceeded {}s",
                limits.wall_timeout_seconds
            ));
            return RunResult {
                status: JobStatus::Timeout,
                rc: TIMEOUT_RC,
                reason: Some(format!("timeout_{}s", limits.wall_timeout_seconds)),
                stdout,
                stderr,
                duration_s,
            };
        }

        let Some(status) = exit else {
            return RunResult::runner_error("lost child process status", duration_s);
        };

        let (status_kind, rc, reason) = match (status.code(), status.signal()) {
            (Some(0), _) => (JobStatus::Finished, 0, None),
            (Some(code), _) => (JobStatus::Failed, code, Some(format!("exit_{code}"))),
            (None, Some(sig)) => {
                let oom = leaf.map(|l| l.oom_kill_count() > 0).unwrap_or(false);
                let reason = if oom {
                    "oom_kill".to_string()
                } else {
                    format!("signal_{sig}")
                };
                (JobStatus::Killed, -sig, Some(reason))
            }
            (None, None) => (
                JobStatus::Failed,
                -1,
                Some("runner_error:unclassifiable exit".to_string()),
            ),
        };

        RunResult {
            status: status_kind,
            rc,
            reason,
            stdout,
            stderr,
            duration_s,
        }
    }
}

/// One captured stream: a drain thread appending into a shared buffer,
/// so the parent can take the partial capture without joining a reader
/// that is still blocked on an open pipe.
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: std::thread::JoinHandle<()>,
}

/// Drain one captured stream on its own thread so a full pipe can never
/// deadlock the wait loop.
fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> Option<StreamCapture> {
    let mut stream = stream?;
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let handle = std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = sink.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    Some(StreamCapture { buf, handle })
}

/// Wait for the reader until `deadline`, then take whatever has arrived.
/// A reader still blocked past the deadline is abandoned: its pipe is
/// held open by a process outside the killed group, and the run must not
/// wait for that process to exit.
fn drain(capture: Option<StreamCapture>, deadline: Instant) -> String {
    let Some(capture) = capture else {
        return String::new();
    };
    while !capture.handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if capture.handle.is_finished() {
        let _ = capture.handle.join();
    } else {
        log::warn!("output pipe still open after the drain grace; keeping the partial capture");
    }
    let buf = capture.buf.lock().map(|b| b.clone()).unwrap_or_default();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Engine construction helper used by the orchestrator and the CLI.
pub fn build_engine(settings: Settings) -> Result<ExecutionEngine> {
    ExecutionEngine::new(settings).map_err(|e| match e {
        SbxError::Environment(msg) => {
            SbxError::Environment(format!("engine initialization failed: {msg}"))
        }
        other => other,
    })
}
