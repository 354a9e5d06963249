//! sbx: sandboxed execution of untrusted code under layered OS isolation
//!
//! A submitted script runs inside a dedicated workspace with, depending on
//! the configured strategy, namespace/chroot confinement, a cgroup-v2 leaf
//! enforcing memory/pids/cpu, a seccomp-BPF syscall filter, and per-process
//! rlimits. Every run ends in exactly one terminal state with a
//! machine-parseable reason, and every kernel resource the run created is
//! released afterwards.
//!
//! Layer map:
//!
//! - [`types`]: jobs, limits, results, the error taxonomy
//! - [`config`]: YAML settings plus `SBX_*` environment overrides
//! - [`rlimits`], [`cgroup`], [`seccomp`], [`namespace`]: the individual
//!   isolation primitives
//! - [`isolation`]: strategy composition and the capability probe
//! - [`executor`]: process launch, wall-clock enforcement, classification
//! - [`storage`], [`jobs`]: workspaces, artifacts, and the job lifecycle
//! - [`cli`]: the scriptable front end

pub mod cgroup;
pub mod cli;
pub mod config;
pub mod executor;
pub mod isolation;
pub mod jobs;
pub mod namespace;
pub mod rlimits;
pub mod runner;
pub mod seccomp;
pub mod storage;
pub mod types;
