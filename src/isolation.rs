/// Composition of isolation layers into a single launch plan.
///
/// The strategy string from configuration ("none", "ns_chroot",
/// "cgroups", "ns_chroot+cgroups", optionally with "seccomp") selects
/// which layers apply. Each layer acts at a different point in the
/// process lifecycle:
///
///   - ns_chroot rewrites the argv before spawn (textual wrapping);
///   - cgroups brackets the run (leaf created before spawn, pid attached
///     right after, torn down after exit);
///   - seccomp and rlimits run inside the child between fork and exec.
///
/// This module owns the argv rewriting and the capability probe; the
/// execution engine owns the lifecycle bracketing.
use crate::config::Settings;
use crate::{cgroup, namespace, seccomp};
use serde::Serialize;
use std::path::Path;

/// Apply the strategy's pre-spawn transformations to the resolved runner
/// command, returning the final argv. With no namespace layer the
/// command passes through untouched.
pub fn compose(settings: &Settings, workspace: &Path, cmd: Vec<String>) -> Vec<String> {
    if settings.strategy_has("ns_chroot") {
        let wrapped = namespace::wrap(settings, workspace, &cmd);
        log::debug!("isolation wrap: {:?} -> {:?}", cmd, wrapped);
        wrapped
    } else {
        cmd
    }
}

/// Point-in-time report of what isolation the host can actually deliver.
/// Purely informational: the probe never gates execution, it makes the
/// gap between requested and effective isolation visible in the
/// persisted artifacts and the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct CapabilityProbe {
    pub strategy: String,
    pub allow_network: bool,
    pub euid: u32,
    pub has_unshare: bool,
    pub has_sh: bool,
    pub has_chroot_rootfs: bool,
    pub can_unshare_net: bool,
    pub cgroup_v2: bool,
    pub cgroup_delegation: bool,
    pub seccomp: &'static str,
}

impl CapabilityProbe {
    pub fn collect(settings: &Settings) -> Self {
        Self {
            strategy: settings.iso_strategy.clone(),
            allow_network: settings.allow_network,
            euid: nix::unistd::Uid::effective().as_raw(),
            has_unshare: binary_on_path("unshare"),
            has_sh: binary_on_path("sh"),
            has_chroot_rootfs: namespace::rootfs_ready(&settings.rootfs),
            can_unshare_net: namespace::can_unshare_net(),
            cgroup_v2: cgroup::ensure_v2().is_ok(),
            cgroup_delegation: cgroup::delegation_ok(),
            seccomp: seccomp::status_str(),
        }
    }

    /// Log the requested-vs-effective gaps at warn level. Called once at
    /// service start so a misconfigured host is loud, not silent.
    pub fn report(&self, settings: &Settings) {
        if settings.strategy_has("ns_chroot") && !self.has_unshare {
            log::warn!("strategy requests ns_chroot but unshare(1) is not on PATH");
        }
        if settings.strategy_has("cgroups") && !self.cgroup_v2 {
            log::warn!("strategy requests cgroups but cgroup v2 is not mounted");
        }
        if settings.seccomp.enabled && self.seccomp != "available" {
            log::warn!("seccomp filtering enabled but the kernel does not expose seccomp; runs proceed unenforced");
        }
        if !settings.allow_network && !self.can_unshare_net {
            log::warn!("network disallowed but no privilege for a network namespace; network is reachable");
        }
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn strategy_none_passes_command_through() {
        let s = Settings::default();
        let cmd = vec!["python3".to_string(), "main.py".to_string()];
        assert_eq!(compose(&s, Path::new("/tmp/ws"), cmd.clone()), cmd);
    }

    #[test]
    fn ns_chroot_strategy_wraps_in_unshare() {
        let s = Settings {
            iso_strategy: "ns_chroot+cgroups".to_string(),
            rootfs: PathBuf::from("/nonexistent/rootfs"),
            ..Settings::default()
        };
        let argv = compose(&s, Path::new("/tmp/ws"), vec!["true".to_string()]);
        assert_eq!(argv[0], "unshare");
    }

    #[test]
    fn probe_reflects_settings_and_never_fails() {
        let s = Settings {
            iso_strategy: "ns_chroot+cgroups+seccomp".to_string(),
            ..Settings::default()
        };
        let probe = CapabilityProbe::collect(&s);
        assert_eq!(probe.strategy, "ns_chroot+cgroups+seccomp");
        assert!(!probe.allow_network);
        probe.report(&s);
        // Serializable for meta.json embedding.
        serde_json::to_value(&probe).unwrap();
    }
}
