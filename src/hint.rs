//! CPU hints for spin loops: pause, cycle counter, prefetch, and the
//! bounded backoff used by every CAS retry loop in the crate.

use serde::{Deserialize, Serialize};

/// Retry/backoff policy for CAS loops.
///
/// Each failed attempt pauses for `2^min(step, spin_limit)` spin-loop hints.
/// `max_attempts == 0` means retry until the CAS succeeds; a failed CAS
/// always means another thread made progress, so this stays lock-free.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinPolicy {
    /// Cap on the exponent of the pause count per attempt
    pub spin_limit: u32,
    /// Failed CAS attempts allowed before giving up (0 = unbounded)
    pub max_attempts: u32,
    /// Pause rounds the consumer waits for a reserved-but-unwritten slot
    pub publish_spins: u32,
}

impl SpinPolicy {
    pub const DEFAULT: Self = Self {
        spin_limit: 6,
        max_attempts: 0,
        publish_spins: 64,
    };

    /// A policy that gives up after `max_attempts` failed CAS attempts.
    pub const fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::DEFAULT
        }
    }

    #[inline]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            step: 0,
        }
    }
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-call backoff state created from a [`SpinPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: SpinPolicy,
    step: u32,
}

impl Backoff {
    /// Record a failed attempt and pause.
    ///
    /// Returns `false` once the attempt budget is exhausted; the caller must
    /// stop retrying.
    #[inline]
    pub fn snooze(&mut self) -> bool {
        self.step = self.step.saturating_add(1);
        if self.policy.max_attempts != 0 && self.step >= self.policy.max_attempts {
            return false;
        }
        let exp = self.step.min(self.policy.spin_limit).min(16);
        for _ in 0..(1u32 << exp) {
            cpu_relax();
        }
        true
    }

    /// Failed attempts recorded so far.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.step
    }
}

/// Spin-wait pause hint (`pause` on x86, `yield` on ARM).
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Read a monotonic cycle counter.
///
/// Uses `rdtsc` on x86_64; elsewhere falls back to nanoseconds since the
/// first call.
#[inline(always)]
pub fn cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no preconditions on x86_64.
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Hint the CPU to pull the cache line holding `ptr` into L1.
#[inline(always)]
pub fn prefetch<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        // SAFETY: prefetch never faults, even on invalid addresses.
        unsafe { _mm_prefetch(ptr as *const i8, _MM_HINT_T0) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}
