/// Process-level resource caps applied in the child between fork and exec.
///
/// Each cap is applied independently and skipped if the kernel rejects it;
/// this layer is best-effort, not the primary containment boundary
/// (the cgroup leaf is).
use crate::types::Limits;
use nix::sys::resource::{setrlimit, Resource};

/// Install CPU-time, address-space and file-descriptor caps on the
/// current process image. Must run after fork/clone and before exec.
///
/// Safe to call from a pre_exec hook: setrlimit syscalls only, no
/// allocation, no locks. That rules out logging here; a rejected cap is
/// skipped silently and the rest still apply.
pub fn apply_rlimits(limits: &Limits) {
    apply_one(Resource::RLIMIT_CPU, limits.cpu_seconds);
    apply_one(Resource::RLIMIT_AS, limits.memory_bytes);
    apply_one(Resource::RLIMIT_NOFILE, limits.nofile);
}

fn apply_one(resource: Resource, value: u64) {
    let _ = setrlimit(resource, value, value);
}
