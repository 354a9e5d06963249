/// Syscall filtering via raw seccomp-BPF.
///
/// A policy document (JSON or YAML) compiles to a classic-BPF program in
/// the parent; the program is installed in the child after
/// `no_new_privs` is set and immediately before exec, so the filter
/// cannot be escaped through a setuid binary and nothing the engine does
/// between install and exec needs to be on the allow list.
///
/// Two policy shapes are supported:
///   - deny-list (documented default): every syscall is allowed except
///     the listed ones, which kill the process;
///   - allow-list (explicit opt-in, `mode: allow_list`): only the listed
///     syscalls are allowed; everything else takes the configured
///     fallback (errno return or process kill).
///
/// Syscall numbers are architecture-specific, so names unknown for the
/// current CPU architecture are skipped rather than treated as fatal.
use crate::types::{Result, SbxError};
use serde::Deserialize;
use std::path::Path;

// BPF instruction classes.
const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

// seccomp return actions.
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

// offsetof(struct seccomp_data, ...) for the fields the prelude loads.
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;

const AUDIT_ARCH_X86_64: u32 = 0xC000_003E;
const AUDIT_ARCH_AARCH64: u32 = 0xC000_00B7;

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;

/// What happens to a syscall outside the allow list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackAction {
    /// Return the given errno to the caller.
    Errno(u16),
    /// Kill the whole process.
    Kill,
}

impl FallbackAction {
    fn ret_value(self) -> u32 {
        match self {
            FallbackAction::Errno(e) => SECCOMP_RET_ERRNO | u32::from(e),
            FallbackAction::Kill => SECCOMP_RET_KILL_PROCESS,
        }
    }
}

/// Resolved filtering policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallPolicy {
    /// Default-allow; listed syscalls are unconditionally fatal.
    DenyList { deny: Vec<String> },
    /// Default-deny with the given fallback; listed syscalls are allowed,
    /// `block` entries are fatal even if also listed in `allow`.
    AllowList {
        allow: Vec<String>,
        block: Vec<String>,
        fallback: FallbackAction,
    },
}

/// On-disk policy document. A bare list of names is also accepted and
/// reads as a deny list.
#[derive(Debug, Default, Deserialize)]
struct PolicyDoc {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    default_action: Option<String>,
    #[serde(default)]
    errno: Option<u16>,
    #[serde(default)]
    syscalls: Vec<String>,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    block: Vec<String>,
}

impl SyscallPolicy {
    /// Parse a policy document from disk. JSON documents are detected by
    /// their first byte; everything else parses as YAML.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SbxError::Seccomp(format!("failed to read policy {}: {e}", path.display())))?;
        Self::from_str(&text)
            .map_err(|e| SbxError::Seccomp(format!("invalid policy {}: {e}", path.display())))
    }

    fn from_str(text: &str) -> std::result::Result<Self, String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(SyscallPolicy::DenyList { deny: Vec::new() });
        }

        // Bare sequence of names => deny list.
        if let Ok(names) = serde_yaml::from_str::<Vec<String>>(trimmed) {
            return Ok(SyscallPolicy::DenyList { deny: dedup(names) });
        }

        let doc: PolicyDoc = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).map_err(|e| e.to_string())?
        } else {
            serde_yaml::from_str(trimmed).map_err(|e| e.to_string())?
        };
        Self::from_doc(doc)
    }

    fn from_doc(doc: PolicyDoc) -> std::result::Result<Self, String> {
        let allow_list_mode = match doc.mode.as_deref() {
            Some("allow_list") => true,
            Some("deny_list") => false,
            // No explicit mode: an `allow` section without a deny list
            // reads as an allow-list document.
            None => doc.syscalls.is_empty() && !doc.allow.is_empty(),
            Some(other) => return Err(format!("unknown policy mode {other:?}")),
        };

        if allow_list_mode {
            let fallback = match doc.default_action.as_deref() {
                Some("kill") | Some("KILL") | Some("KILL_PROCESS") => FallbackAction::Kill,
                Some("errno") | Some("ERRNO") | None => {
                    FallbackAction::Errno(doc.errno.unwrap_or(libc::EPERM as u16))
                }
                Some(other) => return Err(format!("unknown default_action {other:?}")),
            };
            Ok(SyscallPolicy::AllowList {
                allow: dedup(doc.allow),
                block: dedup(doc.block),
                fallback,
            })
        } else {
            let mut deny = doc.syscalls;
            deny.extend(doc.block);
            Ok(SyscallPolicy::DenyList { deny: dedup(deny) })
        }
    }

    /// Compile the policy into a BPF program for the current CPU
    /// architecture. Unknown syscall names are skipped with a warning.
    /// Compilation runs in the parent; only the finished program crosses
    /// into the child's pre-exec hook.
    pub fn compile(&self) -> Result<Vec<libc::sock_filter>> {
        let (audit_arch, table) = current_arch_table()?;

        let mut prog: Vec<libc::sock_filter> = Vec::new();
        // Prelude: kill on architecture mismatch, then load the syscall nr.
        prog.push(insn(BPF_LD_W_ABS, 0, 0, SECCOMP_DATA_ARCH));
        prog.push(insn(BPF_JMP_JEQ_K, 1, 0, audit_arch));
        prog.push(insn(BPF_RET_K, 0, 0, SECCOMP_RET_KILL_PROCESS));
        prog.push(insn(BPF_LD_W_ABS, 0, 0, SECCOMP_DATA_NR));

        match self {
            SyscallPolicy::DenyList { deny } => {
                for nr in resolve_names(deny, table) {
                    prog.push(insn(BPF_JMP_JEQ_K, 0, 1, nr));
                    prog.push(insn(BPF_RET_K, 0, 0, SECCOMP_RET_KILL_PROCESS));
                }
                prog.push(insn(BPF_RET_K, 0, 0, SECCOMP_RET_ALLOW));
            }
            SyscallPolicy::AllowList {
                allow,
                block,
                fallback,
            } => {
                // Block rules first so a name present in both lists is fatal.
                for nr in resolve_names(block, table) {
                    prog.push(insn(BPF_JMP_JEQ_K, 0, 1, nr));
                    prog.push(insn(BPF_RET_K, 0, 0, SECCOMP_RET_KILL_PROCESS));
                }
                for nr in resolve_names(allow, table) {
                    prog.push(insn(BPF_JMP_JEQ_K, 0, 1, nr));
                    prog.push(insn(BPF_RET_K, 0, 0, SECCOMP_RET_ALLOW));
                }
                prog.push(insn(BPF_RET_K, 0, 0, fallback.ret_value()));
            }
        }

        if prog.len() > u16::MAX as usize {
            return Err(SbxError::Seccomp(format!(
                "compiled filter has {} instructions, exceeding the BPF program limit",
                prog.len()
            )));
        }
        Ok(prog)
    }
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().trim_end_matches(';').to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

fn resolve_names(names: &[String], table: &[(&str, u32)]) -> Vec<u32> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match table.iter().find(|(n, _)| n == name) {
            Some((_, nr)) => out.push(*nr),
            None => log::warn!("syscall {name:?} unknown on {}, skipped", std::env::consts::ARCH),
        }
    }
    out
}

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

fn current_arch_table() -> Result<(u32, &'static [(&'static str, u32)])> {
    match std::env::consts::ARCH {
        "x86_64" => Ok((AUDIT_ARCH_X86_64, SYSCALLS_X86_64)),
        "aarch64" => Ok((AUDIT_ARCH_AARCH64, SYSCALLS_AARCH64)),
        other => Err(SbxError::Seccomp(format!(
            "no syscall table for architecture {other}"
        ))),
    }
}

/// Install a compiled filter on the current process. Intended for the
/// child's pre-exec hook: sets `no_new_privs` first, then loads the
/// filter via seccomp(2), falling back to prctl(PR_SET_SECCOMP) on
/// kernels without the syscall. No allocation, std::io::Error only.
pub fn install_filter(prog: &[libc::sock_filter]) -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let fprog = libc::sock_fprog {
        len: prog.len() as libc::c_ushort,
        filter: prog.as_ptr() as *mut libc::sock_filter,
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0,
            &fprog as *const libc::sock_fprog,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOSYS) {
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &fprog as *const libc::sock_fprog,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        return Err(std::io::Error::last_os_error());
    }
    Err(err)
}

/// Whether the kernel exposes seccomp at all. When this is false and
/// filtering was requested, the run proceeds unenforced with an explicit
/// warning in the capability probe.
pub fn is_supported() -> bool {
    Path::new("/proc/sys/kernel/seccomp").exists()
}

pub fn status_str() -> &'static str {
    if is_supported() {
        "available"
    } else {
        "unavailable"
    }
}

// Syscall name -> number tables. Deliberately not exhaustive: names a
// policy uses that are missing here are skipped, matching the contract
// for names the architecture does not have at all.
#[rustfmt::skip]
const SYSCALLS_X86_64: &[(&str, u32)] = &[
    ("read", 0), ("write", 1), ("open", 2), ("close", 3), ("stat", 4),
    ("fstat", 5), ("lstat", 6), ("poll", 7), ("lseek", 8), ("mmap", 9),
    ("mprotect", 10), ("munmap", 11), ("brk", 12), ("rt_sigaction", 13),
    ("rt_sigprocmask", 14), ("rt_sigreturn", 15), ("ioctl", 16),
    ("pread64", 17), ("pwrite64", 18), ("readv", 19), ("writev", 20),
    ("access", 21), ("pipe", 22), ("select", 23), ("sched_yield", 24),
    ("mremap", 25), ("madvise", 28), ("dup", 32), ("dup2", 33),
    ("nanosleep", 35), ("getpid", 39), ("sendfile", 40), ("socket", 41),
    ("connect", 42), ("accept", 43), ("sendto", 44), ("recvfrom", 45),
    ("sendmsg", 46), ("recvmsg", 47), ("shutdown", 48), ("bind", 49),
    ("listen", 50), ("getsockname", 51), ("getpeername", 52),
    ("socketpair", 53), ("setsockopt", 54), ("getsockopt", 55),
    ("clone", 56), ("fork", 57), ("vfork", 58), ("execve", 59),
    ("exit", 60), ("wait4", 61), ("kill", 62), ("uname", 63),
    ("fcntl", 72), ("fsync", 74), ("getcwd", 79), ("chdir", 80),
    ("rename", 82), ("mkdir", 83), ("rmdir", 84), ("unlink", 87),
    ("readlink", 89), ("chmod", 90), ("chown", 92), ("umask", 95),
    ("getrlimit", 97), ("ptrace", 101), ("getuid", 102), ("getgid", 104),
    ("setuid", 105), ("setgid", 106), ("geteuid", 107), ("getegid", 108),
    ("getppid", 110), ("setsid", 112), ("sigaltstack", 131),
    ("statfs", 137), ("pivot_root", 155), ("prctl", 157),
    ("arch_prctl", 158), ("setrlimit", 160), ("chroot", 161),
    ("mount", 165), ("umount2", 166), ("swapon", 167), ("swapoff", 168),
    ("reboot", 169), ("sethostname", 170), ("init_module", 175),
    ("delete_module", 176), ("gettid", 186), ("futex", 202),
    ("sched_getaffinity", 204), ("epoll_create", 213), ("getdents64", 217),
    ("set_tid_address", 218), ("clock_gettime", 228),
    ("clock_nanosleep", 230), ("exit_group", 231), ("epoll_wait", 232),
    ("epoll_ctl", 233), ("tgkill", 234), ("kexec_load", 246),
    ("add_key", 248), ("request_key", 249), ("keyctl", 250),
    ("openat", 257), ("mkdirat", 258), ("unlinkat", 263),
    ("readlinkat", 267), ("faccessat", 269), ("unshare", 272),
    ("set_robust_list", 273), ("epoll_create1", 291), ("dup3", 292),
    ("pipe2", 293), ("perf_event_open", 298), ("prlimit64", 302),
    ("name_to_handle_at", 303), ("open_by_handle_at", 304),
    ("setns", 308), ("process_vm_readv", 310), ("process_vm_writev", 311),
    ("seccomp", 317), ("getrandom", 318), ("memfd_create", 319),
    ("bpf", 321), ("execveat", 322), ("userfaultfd", 323), ("statx", 332),
    ("io_uring_setup", 425), ("io_uring_enter", 426),
    ("io_uring_register", 427), ("clone3", 435), ("close_range", 436),
    ("openat2", 437), ("mount_setattr", 442),
];

#[rustfmt::skip]
const SYSCALLS_AARCH64: &[(&str, u32)] = &[
    ("getcwd", 17), ("eventfd2", 19), ("epoll_create1", 20),
    ("epoll_ctl", 21), ("epoll_pwait", 22), ("dup", 23), ("dup3", 24),
    ("fcntl", 25), ("ioctl", 29), ("mkdirat", 34), ("unlinkat", 35),
    ("symlinkat", 36), ("linkat", 37), ("renameat", 38), ("umount2", 39),
    ("mount", 40), ("pivot_root", 41), ("statfs", 43), ("faccessat", 48),
    ("chdir", 49), ("chroot", 51), ("fchmod", 52), ("fchown", 55),
    ("openat", 56), ("close", 57), ("pipe2", 59), ("getdents64", 61),
    ("lseek", 62), ("read", 63), ("write", 64), ("readv", 65),
    ("writev", 66), ("pread64", 67), ("pwrite64", 68), ("sendfile", 71),
    ("readlinkat", 78), ("newfstatat", 79), ("fstat", 80), ("fsync", 82),
    ("exit", 93), ("exit_group", 94), ("waitid", 95),
    ("set_tid_address", 96), ("unshare", 97), ("futex", 98),
    ("set_robust_list", 99), ("nanosleep", 101), ("clock_gettime", 113),
    ("clock_nanosleep", 115), ("ptrace", 117), ("sched_getaffinity", 123),
    ("sched_yield", 124), ("kill", 129), ("tgkill", 131),
    ("sigaltstack", 132), ("rt_sigaction", 134), ("rt_sigprocmask", 135),
    ("rt_sigreturn", 139), ("setsid", 157), ("uname", 160),
    ("sethostname", 161), ("getrlimit", 163), ("setrlimit", 164),
    ("umask", 166), ("prctl", 167), ("getpid", 172), ("getppid", 173),
    ("getuid", 174), ("geteuid", 175), ("getgid", 176), ("getegid", 177),
    ("gettid", 178), ("socket", 198), ("socketpair", 199), ("bind", 200),
    ("listen", 201), ("accept", 202), ("connect", 203),
    ("getsockname", 204), ("getpeername", 205), ("sendto", 206),
    ("recvfrom", 207), ("setsockopt", 208), ("getsockopt", 209),
    ("shutdown", 210), ("sendmsg", 211), ("recvmsg", 212), ("brk", 214),
    ("munmap", 215), ("mremap", 216), ("add_key", 217),
    ("request_key", 218), ("keyctl", 219), ("clone", 220),
    ("execve", 221), ("mmap", 222), ("swapon", 224), ("swapoff", 225),
    ("mprotect", 226), ("madvise", 233), ("wait4", 260),
    ("prlimit64", 261), ("setns", 268), ("process_vm_readv", 270),
    ("process_vm_writev", 271), ("kexec_load", 104), ("init_module", 105),
    ("delete_module", 106), ("perf_event_open", 241), ("seccomp", 277),
    ("getrandom", 278), ("memfd_create", 279), ("bpf", 280),
    ("name_to_handle_at", 264), ("open_by_handle_at", 265),
    ("execveat", 281), ("userfaultfd", 282), ("statx", 291),
    ("io_uring_setup", 425), ("io_uring_enter", 426),
    ("io_uring_register", 427), ("clone3", 435), ("close_range", 436),
    ("openat2", 437), ("mount_setattr", 442), ("reboot", 142),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_list_parses_as_deny_list() {
        let policy = SyscallPolicy::from_str("- ptrace\n- mount\n- reboot\n").unwrap();
        assert_eq!(
            policy,
            SyscallPolicy::DenyList {
                deny: vec!["ptrace".into(), "mount".into(), "reboot".into()]
            }
        );
    }

    #[test]
    fn deny_list_document_merges_block_entries() {
        let policy = SyscallPolicy::from_str("syscalls: [fork, vfork]\nblock: [ptrace]\n").unwrap();
        match policy {
            SyscallPolicy::DenyList { deny } => {
                assert_eq!(deny, vec!["fork", "vfork", "ptrace"]);
            }
            other => panic!("expected deny list, got {other:?}"),
        }
    }

    #[test]
    fn allow_list_requires_explicit_mode_or_allow_entries() {
        let json = r#"{"mode":"allow_list","default_action":"errno","errno":1,
                        "allow":["read","write","exit_group"],"block":["ptrace"]}"#;
        let policy = SyscallPolicy::from_str(json).unwrap();
        match policy {
            SyscallPolicy::AllowList {
                allow,
                block,
                fallback,
            } => {
                assert_eq!(allow.len(), 3);
                assert_eq!(block, vec!["ptrace"]);
                assert_eq!(fallback, FallbackAction::Errno(1));
            }
            other => panic!("expected allow list, got {other:?}"),
        }
    }

    #[test]
    fn kill_fallback_is_selectable() {
        let policy =
            SyscallPolicy::from_str("mode: allow_list\ndefault_action: kill\nallow: [read]\n")
                .unwrap();
        match policy {
            SyscallPolicy::AllowList { fallback, .. } => {
                assert_eq!(fallback, FallbackAction::Kill)
            }
            other => panic!("expected allow list, got {other:?}"),
        }
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(SyscallPolicy::from_str("mode: sometimes\n").is_err());
    }

    #[test]
    fn duplicate_and_decorated_names_are_normalized() {
        let policy = SyscallPolicy::from_str("- fork;\n- fork\n-  \n").unwrap();
        assert_eq!(policy, SyscallPolicy::DenyList { deny: vec!["fork".into()] });
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn compiled_program_has_arch_prelude_and_default_tail() {
        let policy = SyscallPolicy::DenyList {
            deny: vec!["ptrace".into(), "no_such_syscall_name".into()],
        };
        let prog = policy.compile().unwrap();
        // prelude (4) + one resolved deny pair (2) + allow tail (1);
        // the unknown name contributes nothing.
        assert_eq!(prog.len(), 7);
        assert_eq!(prog[0].code, BPF_LD_W_ABS);
        assert_eq!(prog[0].k, SECCOMP_DATA_ARCH);
        assert_eq!(prog[3].k, SECCOMP_DATA_NR);
        assert_eq!(prog.last().unwrap().k, SECCOMP_RET_ALLOW);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn allow_list_tail_carries_fallback_errno() {
        let policy = SyscallPolicy::AllowList {
            allow: vec!["read".into(), "write".into()],
            block: vec![],
            fallback: FallbackAction::Errno(38),
        };
        let prog = policy.compile().unwrap();
        assert_eq!(prog.last().unwrap().k, SECCOMP_RET_ERRNO | 38);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn shipped_default_policy_resolves_every_entry() {
        let policy = SyscallPolicy::from_path(Path::new("conf/seccomp.min.yaml")).unwrap();
        let deny_len = match &policy {
            SyscallPolicy::DenyList { deny } => deny.len(),
            other => panic!("expected deny list, got {other:?}"),
        };
        let prog = policy.compile().unwrap();
        // Prelude (4) + one jump/ret pair per entry + the allow tail:
        // every shipped deny entry must resolve on this architecture.
        assert_eq!(prog.len(), 4 + 2 * deny_len + 1);
    }

    #[test]
    fn empty_policy_is_a_no_op_deny_list() {
        let policy = SyscallPolicy::from_str("").unwrap();
        assert_eq!(policy, SyscallPolicy::DenyList { deny: Vec::new() });
    }
}
