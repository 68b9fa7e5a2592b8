//! Concurrency planning for batch rotation
//!
//! Turns the configured job count into the worker pool size, deriving it from
//! the CPU core count when the configuration asks for it.

use crate::config::MAX_CONCURRENCY;

/// Smallest pool the scheduler will run with
pub const MIN_CONCURRENCY: u32 = 1;

/// Clamp a requested worker count to the supported range [1, 16]
pub fn clamp_concurrency(requested: u32) -> usize {
    requested.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY) as usize
}

/// Resolve the configured job count into a pool size
///
/// - `0` derives the pool from the core count: one encoder per four cores,
///   since every ffmpeg instance is itself multi-threaded
/// - any other value is used as given, clamped to [1, 16]
pub fn derive_concurrency(configured: u32) -> usize {
    derive_concurrency_for_cores(configured, num_cpus::get() as u32)
}

fn derive_concurrency_for_cores(configured: u32, cores: u32) -> usize {
    if configured > 0 {
        clamp_concurrency(configured)
    } else {
        clamp_concurrency(cores / 4)
    }
}
