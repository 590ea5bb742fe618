/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Configuration inputs for [`crate::Runtime`] and the runtime-wide error
//! taxonomy.
//!
//! In the original the configuration table ("n_cpus", "max_threads", etc.)
//! is produced by an external build tool and linked into the program; here
//! it is just a plain struct constructed by the host application.

use std::env;

/// Default stack size (16 KiB) handed to a trampoline when the caller
/// doesn't ask for a specific one. The original relies on static
/// stack-usage analysis performed by a compiler plugin; without that
/// analysis a conservative fixed default is used instead, with a per-spawn
/// override (see `SPEC_FULL.md` §9).
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Runtime-wide configuration, mirroring the table described in `spec.md`
/// §6 ("Configuration inputs"): `n_cpus`, `max_threads`, `max_procs_hint`,
/// and the per-trampoline stack size table.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Caps the number of CPUs the scheduler uses. `None` means "use the OS
    /// online-processor count", which is always a further cap regardless of
    /// this value (`spec.md` §6).
    pub n_cpus: Option<usize>,

    /// Total number of kernel threads across all CPUs, including spare pool
    /// cores.
    pub max_threads: usize,

    /// Sizing hint for each CPU's global run queue capacity
    /// (`max_procs_hint / n_cpus`, rounded up to a power of two).
    pub max_procs_hint: usize,

    /// Page-rounded stack size to use when a spawn doesn't specify one.
    pub default_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            n_cpus: None,
            max_threads: 64,
            max_procs_hint: 1 << 20,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder { RuntimeConfigBuilder::default() }

    /// Reads `CSP_N_CPUS`, `CSP_MAX_THREADS`, `CSP_MAX_PROCS_HINT` from the
    /// environment, falling back to [`RuntimeConfig::default`] for anything
    /// absent or unparseable. Ambient convenience only — the original's
    /// `.session` trampoline-id counter is a build-time concern with no
    /// runtime analogue (`spec.md` §6 "Persisted state") and is not
    /// reproduced here.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            n_cpus: env::var("CSP_N_CPUS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(default.n_cpus),
            max_threads: env::var("CSP_MAX_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_threads),
            max_procs_hint: env::var("CSP_MAX_PROCS_HINT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_procs_hint),
            default_stack_size: default.default_stack_size,
        }
    }

    /// The number of CPUs the scheduler will actually use: `n_cpus`, capped
    /// by the OS online-processor count, with a floor of 1.
    #[must_use]
    pub fn effective_cpu_count(&self) -> usize {
        let online = online_cpu_count();
        let requested = self.n_cpus.unwrap_or(online);
        requested.clamp(1, online.max(1))
    }
}

/// `sysconf(_SC_NPROCESSORS_ONLN)`, mirroring
/// `examples/original_source/src/sched.c`'s `csp_sched_start`.
fn online_cpu_count() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 { 1 } else { n as usize }
}

/// Builder for [`RuntimeConfig`], following this workspace's established
/// builder convention (see `macro/`'s `#[derive(Builder)]`; reproduced by
/// hand here since this crate has no proc-macro dependency of its own).
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    inner: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    #[must_use]
    pub fn n_cpus(mut self, n: usize) -> Self {
        self.inner.n_cpus = Some(n);
        self
    }

    #[must_use]
    pub fn max_threads(mut self, n: usize) -> Self {
        self.inner.max_threads = n;
        self
    }

    #[must_use]
    pub fn max_procs_hint(mut self, n: usize) -> Self {
        self.inner.max_procs_hint = n;
        self
    }

    #[must_use]
    pub fn default_stack_size(mut self, n: usize) -> Self {
        self.inner.default_stack_size = n;
        self
    }

    #[must_use]
    pub fn build(self) -> RuntimeConfig { self.inner }
}

/// Error taxonomy for the runtime's *setup* paths (`spec.md` §7,
/// "Structural/unrecoverable"). Steady-state operations (`try_push`,
/// `timer_cancel`, netpoll readiness races) return `bool`/status enums, not
/// `Result`, because contention and timeout are expected outcomes, not
/// errors — see `SPEC_FULL.md` §7.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CspError {
    #[error("failed to allocate {size} bytes on cpu {cpu_id}: {reason}")]
    Exhausted {
        cpu_id: usize,
        size: usize,
        reason: String,
    },

    #[error("failed to initialize epoll netpoll registry: {0}")]
    NetpollInit(String),

    #[error("fd {0} is out of range for the netpoll waiter table")]
    InvalidFd(i32),

    #[error("failed to spawn core thread for cpu {0}: {1}")]
    ThreadSpawn(usize, String),

    #[error("getrlimit(RLIMIT_NOFILE) failed")]
    RlimitUnavailable,
}
