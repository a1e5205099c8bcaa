/*!
 * Lock-Free Dispatch Statistics
 * Atomic counters bumped on the trap path, readable from anywhere
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    pub traps: u64,
    pub syscalls: u64,
    pub faults_resolved: u64,
    pub exceptions: u64,
    pub second_chance: u64,
    pub apcs: u64,
    pub host_recoveries: u64,
    pub thread_aborts: u64,
    pub unresolved: u64,
}

/// Atomic dispatch statistics
///
/// # Performance
/// - Cache-line aligned to prevent false sharing
/// - Relaxed ordering; counters are independent
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct DispatchStats {
    traps: AtomicU64,
    syscalls: AtomicU64,
    faults_resolved: AtomicU64,
    exceptions: AtomicU64,
    second_chance: AtomicU64,
    apcs: AtomicU64,
    host_recoveries: AtomicU64,
    thread_aborts: AtomicU64,
    unresolved: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline(always)]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl DispatchStats {
    pub const fn new() -> Self {
        Self {
            traps: AtomicU64::new(0),
            syscalls: AtomicU64::new(0),
            faults_resolved: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            second_chance: AtomicU64::new(0),
            apcs: AtomicU64::new(0),
            host_recoveries: AtomicU64::new(0),
            thread_aborts: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
        }
    }

    counter! {
        inc_traps => traps,
        inc_syscalls => syscalls,
        inc_faults_resolved => faults_resolved,
        inc_exceptions => exceptions,
        inc_second_chance => second_chance,
        inc_apcs => apcs,
        inc_host_recoveries => host_recoveries,
        inc_thread_aborts => thread_aborts,
        inc_unresolved => unresolved,
    }

    /// Read-only snapshot; no synchronization between fields
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            traps: self.traps.load(Ordering::Relaxed),
            syscalls: self.syscalls.load(Ordering::Relaxed),
            faults_resolved: self.faults_resolved.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            second_chance: self.second_chance.load(Ordering::Relaxed),
            apcs: self.apcs.load(Ordering::Relaxed),
            host_recoveries: self.host_recoveries.load(Ordering::Relaxed),
            thread_aborts: self.thread_aborts.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
        }
    }
}
