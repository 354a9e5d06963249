/// Cgroup-v2 resource containment: one leaf per job under a fixed service
/// base node.
///
/// The kernel, not user space, enforces memory/pids/cpu on the whole
/// process tree; this module only manages the filesystem-backed lifecycle:
///
///   absent -> created -> limited -> attached -> (running) -> torn-down
///
/// The shared base node is initialized exactly once per service
/// (delegation check, subtree control), never re-touched per job.
use crate::types::{Limits, Result, SbxError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const REQUIRED_CONTROLLERS: [&str; 3] = ["memory", "pids", "cpu"];

/// Upper bound on concurrent processes inside one leaf. The Limits value
/// object carries no pid budget, so containment uses a fixed ceiling.
const PIDS_MAX: u64 = 64;

/// cpu.max quota/period granting one full CPU to the leaf.
const CPU_MAX: &str = "100000 100000";

const TEARDOWN_RETRIES: u32 = 5;
const TEARDOWN_BACKOFF: Duration = Duration::from_millis(100);

/// Process-wide handle to the service's cgroup base node. Constructed
/// once at service start; hands out per-job leaves keyed by job id.
#[derive(Clone, Debug)]
pub struct CgroupService {
    base: PathBuf,
}

impl CgroupService {
    /// Verify cgroup v2 is mounted, resolve the base node (override or
    /// `/proc/self/cgroup` + `/sbx`), create it, and enable subtree
    /// control for the required controllers.
    ///
    /// Fails fast with a descriptive error when the base node holds
    /// processes (the kernel refuses subtree control on a non-empty node)
    /// or when a required controller is not delegated.
    pub fn init(base_override: Option<&Path>) -> Result<Self> {
        ensure_v2()?;

        let base = match base_override {
            Some(p) => {
                if !p.starts_with(CGROUP_ROOT) {
                    return Err(SbxError::Config(format!(
                        "cgroup base override must live under {CGROUP_ROOT}, got {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => self_cgroup_dir()?.join("sbx"),
        };

        fs::create_dir_all(&base)
            .map_err(|e| SbxError::Cgroup(format!("failed to create base node {}: {e}", base.display())))?;

        enable_subtree_control(&base)?;
        log::info!("cgroup base initialized at {}", base.display());
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create the per-job leaf directory. Idempotent: a pre-existing
    /// directory is not an error.
    pub fn create_leaf(&self, job_id: &str) -> Result<CgroupLeaf> {
        let path = self.base.join(job_id);
        fs::create_dir_all(&path)
            .map_err(|e| SbxError::Cgroup(format!("failed to create leaf {}: {e}", path.display())))?;
        Ok(CgroupLeaf { path })
    }
}

/// One job's innermost cgroup directory. Created before process spawn,
/// removed by the execution engine after the process tree has exited;
/// it must never outlive the run.
#[derive(Debug)]
pub struct CgroupLeaf {
    path: PathBuf,
}

impl CgroupLeaf {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the controller limit files. Every write that matters for
    /// correctness is read back and compared: the kernel silently
    /// clamping or rejecting a value must not be mistaken for success.
    pub fn set_limits(&self, limits: &Limits) -> Result<()> {
        self.write_verified("memory.max", &limits.memory_bytes.to_string())?;

        // Swap accounting may be compiled out on the host; tolerated.
        let swap = self.path.join("memory.swap.max");
        if swap.exists() {
            self.write_verified("memory.swap.max", "0")?;
        } else {
            log::debug!("memory.swap.max absent on {}, skipping", self.path.display());
        }

        // Kill the whole group on OOM so no half-dead process tree lingers.
        let oom_group = self.path.join("memory.oom.group");
        if oom_group.exists() {
            self.write_verified("memory.oom.group", "1")?;
        }

        self.write_verified("pids.max", &PIDS_MAX.to_string())?;
        self.write_verified("cpu.max", CPU_MAX)?;
        Ok(())
    }

    /// Attach a live PID to the leaf. Must happen immediately after
    /// process creation, before the child can spawn descendants outside
    /// the bound; once written, the kernel contains the whole tree.
    pub fn attach(&self, pid: u32) -> Result<()> {
        let procs = self.path.join("cgroup.procs");
        fs::write(&procs, pid.to_string()).map_err(|e| {
            SbxError::Cgroup(format!(
                "failed to attach pid {pid} to {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Best-effort accounting snapshot for diagnostics. Absent files are
    /// simply omitted.
    pub fn read_metrics(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for name in ["memory.current", "memory.peak", "memory.events", "cpu.stat", "pids.current"] {
            if let Ok(text) = fs::read_to_string(self.path.join(name)) {
                out.insert(name.to_string(), text.trim().to_string());
            }
        }
        out
    }

    /// Number of OOM kills the kernel recorded in this leaf.
    pub fn oom_kill_count(&self) -> u64 {
        let Ok(events) = fs::read_to_string(self.path.join("memory.events")) else {
            return 0;
        };
        for line in events.lines() {
            if let Some(value) = line.strip_prefix("oom_kill ") {
                return value.trim().parse().unwrap_or(0);
            }
        }
        0
    }

    /// Remove the leaf directory. The kernel refuses removal while any
    /// process is still attached, so removal races with the OS reaping
    /// the child; retry a bounded number of times, then log and abandon.
    /// A leaked empty node is a latent resource leak, not a safety
    /// violation, and never fails the job.
    pub fn teardown(&self) {
        for attempt in 0..TEARDOWN_RETRIES {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    log::debug!(
                        "teardown of {} attempt {} failed: {e}",
                        self.path.display(),
                        attempt + 1
                    );
                    std::thread::sleep(TEARDOWN_BACKOFF);
                }
            }
        }
        log::warn!(
            "abandoning cgroup leaf {} after {TEARDOWN_RETRIES} removal attempts",
            self.path.display()
        );
    }

    fn write_verified(&self, name: &str, value: &str) -> Result<()> {
        let file = self.path.join(name);
        fs::write(&file, value)
            .map_err(|e| SbxError::Cgroup(format!("failed to write {}={value}: {e}", file.display())))?;
        let back = fs::read_to_string(&file)
            .map_err(|e| SbxError::Cgroup(format!("failed to read back {}: {e}", file.display())))?;
        if !limit_value_matches(value, back.trim()) {
            return Err(SbxError::Cgroup(format!(
                "limit verification failed for {}: wrote {value:?}, kernel reports {:?}",
                file.display(),
                back.trim()
            )));
        }
        Ok(())
    }
}

/// Compare a written limit against the kernel's echo. cpu.max collapses
/// whitespace; numeric files echo the number verbatim.
fn limit_value_matches(wrote: &str, read: &str) -> bool {
    let norm = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    norm(wrote) == norm(read)
}

/// Verify the unified cgroup-v2 hierarchy is mounted.
pub fn ensure_v2() -> Result<()> {
    if Path::new(CGROUP_ROOT).join("cgroup.controllers").exists() {
        Ok(())
    } else {
        Err(SbxError::Environment(
            "cgroup v2 is required (no cgroup.controllers under /sys/fs/cgroup)".to_string(),
        ))
    }
}

/// True when the required controllers are delegated to this process's own
/// cgroup. Probe-only; `CgroupService::init` re-checks on its actual base.
pub fn delegation_ok() -> bool {
    let Ok(dir) = self_cgroup_dir() else {
        return false;
    };
    fs::read_to_string(dir.join("cgroup.controllers"))
        .map(|text| {
            let have: Vec<&str> = text.split_whitespace().collect();
            REQUIRED_CONTROLLERS.iter().all(|c| have.contains(c))
        })
        .unwrap_or(false)
}

/// Resolve the current process's own cgroup directory from the unified
/// hierarchy ("0::/<relative>" line in /proc/self/cgroup).
fn self_cgroup_dir() -> Result<PathBuf> {
    let text = fs::read_to_string("/proc/self/cgroup")
        .map_err(|e| SbxError::Environment(format!("failed to read /proc/self/cgroup: {e}")))?;
    for line in text.lines() {
        if let Some(rel) = line.strip_prefix("0::") {
            return Ok(Path::new(CGROUP_ROOT).join(rel.trim().trim_start_matches('/')));
        }
    }
    Err(SbxError::Environment(
        "no unified (0::) entry in /proc/self/cgroup".to_string(),
    ))
}

/// Enable memory/pids/cpu for children of `node`. The kernel requires the
/// node to have no directly-attached processes before subtree control can
/// change; surfacing that here is clearer than a vague EPERM later, when
/// the leaf's memory.max write fails.
fn enable_subtree_control(node: &Path) -> Result<()> {
    let controllers_file = node.join("cgroup.controllers");
    let have: Vec<String> = fs::read_to_string(&controllers_file)
        .map_err(|e| SbxError::Environment(format!("failed to read {}: {e}", controllers_file.display())))?
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let missing: Vec<&str> = REQUIRED_CONTROLLERS
        .iter()
        .copied()
        .filter(|c| !have.iter().any(|h| h == c))
        .collect();
    if !missing.is_empty() {
        return Err(SbxError::Environment(format!(
            "controllers {missing:?} not delegated on {} (have {have:?})",
            node.display()
        )));
    }

    let procs = fs::read_to_string(node.join("cgroup.procs")).unwrap_or_default();
    if !procs.trim().is_empty() {
        return Err(SbxError::Environment(format!(
            "{} has attached processes; move them out before enabling subtree control",
            node.display()
        )));
    }

    let want: String = REQUIRED_CONTROLLERS
        .iter()
        .map(|c| format!("+{c}"))
        .collect::<Vec<_>>()
        .join(" ");
    fs::write(node.join("cgroup.subtree_control"), &want).map_err(|e| {
        SbxError::Environment(format!(
            "failed to enable subtree control ({want}) on {}: {e}",
            node.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_comparison_normalizes_whitespace() {
        assert!(limit_value_matches("100000 100000", "100000 100000\n"));
        assert!(limit_value_matches("100000  100000", "100000 100000"));
        assert!(!limit_value_matches("134217728", "67108864"));
    }

    #[test]
    fn base_override_must_live_under_cgroupfs() {
        let err = CgroupService::init(Some(Path::new("/tmp/evil"))).unwrap_err();
        // Rejected either as a config error or, on hosts without cgroup v2,
        // as an environment error from the mount check that runs first.
        let msg = err.to_string();
        assert!(msg.contains("/sys/fs/cgroup") || msg.contains("cgroup v2"));
    }

    #[test]
    fn teardown_of_missing_leaf_is_silent() {
        let leaf = CgroupLeaf {
            path: PathBuf::from("/sys/fs/cgroup/sbx-test-does-not-exist"),
        };
        leaf.teardown();
    }

    #[test]
    fn oom_count_is_zero_without_events_file() {
        let leaf = CgroupLeaf {
            path: PathBuf::from("/nonexistent"),
        };
        assert_eq!(leaf.oom_kill_count(), 0);
        assert!(leaf.read_metrics().is_empty());
    }
}
