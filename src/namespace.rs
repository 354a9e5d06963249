/// Namespace and chroot wrapping for the resolved runner command.
///
/// Isolation is expressed textually: the runner command is wrapped in an
/// `unshare(1)` invocation (plus a chroot shell sequence when an alternate
/// rootfs is available) and the whole thing is handed to the process
/// spawner as a single argv. Building text instead of issuing the raw
/// clone/mount/chroot syscalls keeps each layer inspectable: the exact
/// wrapped command is logged and persisted with the run artifacts.
///
/// Two modes:
///   - host mode: user+mount+pid namespaces over the host filesystem,
///     confined to the job workspace by `cd`;
///   - chroot mode: a full private-mount sequence that bind-mounts the
///     workspace into the rootfs, mounts a fresh /proc, optionally
///     remounts the workspace noexec, chroots, runs, and unwinds.
///
/// The network namespace is only requested when the network is disallowed
/// AND the service runs as root; `unshare --net` without privilege fails
/// the whole run, which is worse than the probe reporting the gap.
use crate::config::Settings;
use nix::unistd::Uid;
use std::path::Path;

/// True when the alternate rootfs is populated enough to chroot into.
/// The marker is `<rootfs>/bin/sh`: without a shell inside, the chroot
/// sequence cannot run at all.
pub fn rootfs_ready(rootfs: &Path) -> bool {
    rootfs.join("bin/sh").is_file()
}

/// Whether this process may request a network namespace.
pub fn can_unshare_net() -> bool {
    Uid::effective().is_root()
}

/// Wrap `cmd` (the resolved runner argv) for namespace isolation.
/// Returns the new argv; `cmd` itself is never mutated.
pub fn wrap(settings: &Settings, workspace: &Path, cmd: &[String]) -> Vec<String> {
    let inner = cmd
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");

    if rootfs_ready(&settings.rootfs) {
        wrap_chroot(settings, workspace, &inner)
    } else {
        wrap_host(settings, workspace, &inner)
    }
}

fn net_flag(settings: &Settings) -> Option<&'static str> {
    if !settings.allow_network && can_unshare_net() {
        Some("--net")
    } else {
        None
    }
}

/// Host mode: namespaces only, no alternate root. `--map-root-user` makes
/// the user namespace usable without privilege; `--fork` is required for
/// the pid namespace to take effect on the child.
fn wrap_host(settings: &Settings, workspace: &Path, inner: &str) -> Vec<String> {
    let mut argv = vec![
        "unshare".to_string(),
        "--user".to_string(),
        "--map-root-user".to_string(),
        "--mount".to_string(),
        "--pid".to_string(),
        "--fork".to_string(),
    ];
    if let Some(flag) = net_flag(settings) {
        argv.push(flag.to_string());
    }
    argv.push("sh".to_string());
    argv.push("-c".to_string());
    argv.push(format!(
        "cd {} && {inner}",
        shell_quote(&workspace.display().to_string())
    ));
    argv
}

/// Chroot mode: bind the workspace into the rootfs at /work, mount a
/// fresh /proc, optionally harden the workspace mount, chroot, run, then
/// unwind the mounts. The runner's exit code is captured before the
/// unwind so cleanup failures cannot overwrite it; the umounts are
/// tolerated to fail since the private mount namespace dies with the
/// wrapper anyway.
fn wrap_chroot(settings: &Settings, workspace: &Path, inner: &str) -> Vec<String> {
    let rootfs = shell_quote(&settings.rootfs.display().to_string());
    let ws = shell_quote(&workspace.display().to_string());

    let mut script = String::new();
    script.push_str(&format!("mkdir -p {rootfs}/work {rootfs}/proc && "));
    script.push_str(&format!("mount --bind {ws} {rootfs}/work && "));
    script.push_str(&format!("mount -t proc proc {rootfs}/proc && "));
    if settings.noexec_work {
        script.push_str(&format!(
            "mount -o remount,bind,noexec,nosuid,nodev {rootfs}/work && "
        ));
    }
    script.push_str(&format!(
        "chroot {rootfs} /bin/sh -c {}; rc=$?; ",
        shell_quote(&format!("cd /work && {inner}"))
    ));
    script.push_str(&format!(
        "umount {rootfs}/proc || true; umount {rootfs}/work || true; exit $rc"
    ));

    let mut argv = vec![
        "unshare".to_string(),
        "--mount".to_string(),
        "--uts".to_string(),
        "--ipc".to_string(),
        "--pid".to_string(),
        "--fork".to_string(),
        "--user".to_string(),
        "--map-root-user".to_string(),
    ];
    if let Some(flag) = net_flag(settings) {
        argv.push(flag.to_string());
    }
    argv.push("sh".to_string());
    argv.push("-c".to_string());
    argv.push(script);
    argv
}

/// Single-quote a string for POSIX sh. Embedded single quotes use the
/// standard '\'' splice.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'='))
    {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
