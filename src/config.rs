/// Service configuration: YAML settings file plus SBX_* environment overrides.
///
/// The configuration surface is externally supplied, never computed by the
/// core: isolation strategy, network allow flag, per-resource limit
/// defaults, seccomp flag + policy path, cgroup base override, jobs root.
use crate::types::{Limits, Result, SbxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Seccomp configuration block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeccompSettings {
    /// Filtering is disabled unless explicitly enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Policy document path (JSON or YAML).
    #[serde(default = "default_seccomp_policy")]
    pub policy: PathBuf,
}

impl Default for SeccompSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: default_seccomp_policy(),
        }
    }
}

fn default_seccomp_policy() -> PathBuf {
    PathBuf::from("conf/seccomp.min.yaml")
}

/// Runtime binary names per language, overridable per host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_python_bin")]
    pub python: String,
    #[serde(default = "default_node_bin")]
    pub node: String,
    #[serde(default = "default_bash_bin")]
    pub bash: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            python: default_python_bin(),
            node: default_node_bin(),
            bash: default_bash_bin(),
        }
    }
}

fn default_python_bin() -> String {
    "python3".to_string()
}
fn default_node_bin() -> String {
    "node".to_string()
}
fn default_bash_bin() -> String {
    "bash".to_string()
}

/// In-memory settings for the whole service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory holding one workspace per job.
    pub jobs_root: PathBuf,
    /// Alternate root filesystem for chroot mode; host mode when absent
    /// or not ready.
    pub rootfs: PathBuf,
    /// Composable isolation strategy, e.g. "ns_chroot+cgroups", "none".
    pub iso_strategy: String,
    /// Allow the sandboxed program to reach the host network.
    pub allow_network: bool,
    /// Remount the bind-mounted workspace noexec,nosuid,nodev in chroot mode.
    pub noexec_work: bool,
    /// Cgroup-v2 base node override; derived from /proc/self/cgroup when unset.
    pub cgroup_base: Option<PathBuf>,
    pub seccomp: SeccompSettings,
    pub limits: Limits,
    pub runtimes: RuntimeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jobs_root: PathBuf::from("jobs"),
            rootfs: PathBuf::from("/srv/sbx/rootfs"),
            iso_strategy: "none".to_string(),
            allow_network: false,
            noexec_work: true,
            cgroup_base: None,
            seccomp: SeccompSettings::default(),
            limits: Limits::default(),
            runtimes: RuntimeSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, then apply SBX_* environment
    /// overrides. A missing file yields the defaults (the file is a thin
    /// I/O wrapper, not a correctness boundary).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&text)
                    .map_err(|e| SbxError::Config(format!("failed to parse {}: {e}", p.display())))?
            }
            Some(p) => {
                log::warn!("settings file {} not found, using defaults", p.display());
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SBX_JOBS_ROOT") {
            self.jobs_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SBX_ISO_STRATEGY") {
            self.iso_strategy = v;
        }
        if let Ok(v) = std::env::var("SBX_CGROUP_BASE") {
            self.cgroup_base = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SBX_ROOTFS") {
            self.rootfs = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SBX_ALLOW_NETWORK") {
            self.allow_network = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    /// Resolve the immutable limits for one run. Called once per run; the
    /// returned value is never mutated afterwards.
    pub fn resolve_limits(&self) -> Limits {
        self.limits
    }

    pub fn strategy_has(&self, component: &str) -> bool {
        self.iso_strategy
            .split('+')
            .any(|part| part.trim() == component)
    }
}
