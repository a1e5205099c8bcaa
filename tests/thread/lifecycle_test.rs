/*!
 * Thread Lifecycle Tests
 * Slot exhaustion and recovery, start/join through the dispatch core
 */

use super::common::ScriptedDispatcher;
use personality_kernel::core::NtStatus;
use personality_kernel::thread::{ThreadError, ThreadState};
use personality_kernel::{Runtime, RuntimeConfig, RuntimeError};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn runtime(capacity: usize) -> (Runtime, Arc<ScriptedDispatcher>) {
    let dispatcher = Arc::new(ScriptedDispatcher::default());
    let runtime = Runtime::builder(dispatcher.clone())
        .with_config(RuntimeConfig::default().with_thread_capacity(capacity))
        .build()
        .unwrap();
    (runtime, dispatcher)
}

#[test]
fn test_exhaustion_reports_too_many_threads() {
    let (runtime, _) = runtime(3);
    let threads = runtime.threads();
    let slots: Vec<_> = (0..3).map(|_| threads.allocate().unwrap()).collect();

    let err = threads.allocate().unwrap_err();
    assert!(matches!(err, ThreadError::ResourceExhausted { capacity: 3 }));
    assert_eq!(NtStatus::from(&err), NtStatus::TOO_MANY_THREADS);
    let err: RuntimeError = err.into();
    assert_eq!(err.category(), Some(personality_kernel::ErrorCategory::ResourceExhausted));

    // Recovery: a freed slot is immediately reusable
    threads.free(slots[1]).unwrap();
    let again = threads.allocate().unwrap();
    assert_eq!(again, slots[1]);
    assert_eq!(threads.count(), 3);
    assert_eq!(threads.threads(), vec![slots[0], slots[2], again]);
}

#[test]
fn test_recovery_after_threads_exit() {
    let (runtime, dispatcher) = runtime(2);
    let threads = runtime.threads();

    for round in 0..4u64 {
        let a = threads.allocate().unwrap();
        let b = threads.allocate().unwrap();
        assert!(threads.allocate().is_err());

        threads.start(a, 0x40_1000, round, false).unwrap();
        threads.start(b, 0x40_2000, round + 100, false).unwrap();
        assert_eq!(threads.join(a).unwrap(), NtStatus(round as u32));
        assert_eq!(threads.join(b).unwrap(), NtStatus(round as u32 + 100));
        assert_eq!(threads.state(a).unwrap(), ThreadState::Exiting);

        threads.free(a).unwrap();
        threads.free(b).unwrap();
        assert_eq!(threads.count(), 0);
    }
    assert_eq!(dispatcher.started.lock().len(), 8);
    assert_eq!(runtime.status().free_thread_slots, 2);
}

#[test]
fn test_running_thread_cannot_be_freed() {
    let (runtime, _) = runtime(1);
    let threads = runtime.threads();
    let slot = threads.allocate().unwrap();
    threads.start(slot, 0x1000, 0, true).unwrap();
    assert!(matches!(threads.free(slot), Err(ThreadError::StillRunning(_))));

    assert!(threads.resume(slot).unwrap());
    assert_eq!(threads.join(slot).unwrap(), NtStatus::SUCCESS);
    threads.free(slot).unwrap();
    assert!(matches!(threads.state(slot), Err(ThreadError::InvalidSlot(_))));
}

#[test]
fn test_thread_info_snapshot() {
    let (runtime, _) = runtime(2);
    let threads = runtime.threads();
    let slot = threads.allocate().unwrap();
    threads.set_thread_id(slot, 40, 41).unwrap();
    let info = threads.info(slot).unwrap();
    assert_eq!(info.teb, runtime.space().tebs().teb_address(slot));
    assert_eq!((info.pid, info.tid), (40, 41));
    assert_eq!(info.state, ThreadState::Allocated);
    assert_eq!(info.pending_io, 0);
}
