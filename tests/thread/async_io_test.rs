/*!
 * Async I/O End-to-End Tests
 * Request -> system APC during a wait -> callback -> completion record
 */

use super::common::{apc_bytes, FakeCoordinator};
use personality_kernel::core::{NtStatus, ProcessLatch};
use personality_kernel::ipc::protocol::APC_RESULT_SIZE;
use personality_kernel::ipc::{
    ApcCall, ApcResult, CompletionRecord, Opcode, SelectFields, SelectFlags, SelectOp, SelectOutcome,
    SystemApcHandler, Timeout,
};
use personality_kernel::memory::AddressSpace;
use personality_kernel::thread::{AsyncIoOutcome, ThreadManager};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

fn manager() -> Arc<ThreadManager> {
    let space = Arc::new(AddressSpace::new(2).unwrap());
    Arc::new(ThreadManager::new(space, Arc::new(ProcessLatch::new())))
}

#[test]
fn test_async_read_completes_through_wait() {
    let threads = manager();
    let slot = threads.allocate().unwrap();
    let (session, mut fake) = FakeCoordinator::session();
    threads.attach_channel(slot, session.clone()).unwrap();
    let handler: Arc<dyn SystemApcHandler> = threads.clone();
    session.set_system_apc_handler(Arc::downgrade(&handler));

    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let id = threads
        .alloc_fileio(
            slot,
            0x44,
            0xfeed,
            Box::new(move |io| {
                seen.fetch_add(1, Ordering::SeqCst);
                io.information = 512;
                true
            }),
        )
        .unwrap();
    assert_eq!(threads.pending(slot).unwrap(), vec![id]);
    let descriptor = threads.async_descriptor(id, 0, 0, 0, 0x7000).unwrap();
    assert_eq!(descriptor.handle, 0x44);

    let server = thread::spawn(move || {
        let (header, _) = fake.next();
        assert_eq!(header.opcode, Opcode::Select);
        let call = ApcCall::AsyncIo {
            user: descriptor.user,
            status: NtStatus::SUCCESS,
        };
        fake.reply(NtStatus::KERNEL_APC, &[], &apc_bytes(call));

        let (header, data) = fake.next();
        assert_eq!(header.opcode, Opcode::AddCompletion);
        assert!(data.is_empty());
        let record = CompletionRecord::from_fields(&header.fields);
        assert_eq!(record.handle, 0x44);
        assert_eq!(record.value, 0xfeed);
        assert_eq!(record.status, NtStatus::SUCCESS);
        assert_eq!(record.information, 512);
        fake.reply(NtStatus::SUCCESS, &[], &[]);

        let (header, data) = fake.next();
        assert_eq!(header.opcode, Opcode::Select);
        assert_eq!(SelectFields::decode(&header.fields).flags, SelectFlags::ALERTABLE);
        let result = ApcResult::decode(&mut &data[..APC_RESULT_SIZE]).unwrap();
        assert_eq!(
            result,
            ApcResult::AsyncIo {
                status: NtStatus::SUCCESS,
                total: 512
            }
        );
        fake.reply(NtStatus::WAIT_0, &[], &apc_bytes(ApcCall::None));
    });

    let outcome = session
        .wait(
            &SelectOp::Wait {
                handles: vec![0x44],
                all: false,
            },
            SelectFlags::ALERTABLE,
            Timeout::Infinite,
        )
        .unwrap();
    server.join().unwrap();

    assert_eq!(outcome, SelectOutcome::Satisfied(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(threads.pending(slot).unwrap().is_empty());
    assert_eq!(session.staged_len(), 0);
}

#[test]
fn test_restart_keeps_request_pending() {
    let threads = manager();
    let slot = threads.allocate().unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let id = threads
        .alloc_fileio(
            slot,
            9,
            0,
            Box::new(move |_| seen.fetch_add(1, Ordering::SeqCst) > 0),
        )
        .unwrap();

    assert_eq!(
        threads.complete(id, NtStatus::PENDING, 0).unwrap(),
        AsyncIoOutcome::Restart
    );
    assert_eq!(threads.pending(slot).unwrap(), vec![id]);

    // Second delivery completes, but there is no session to report to
    assert!(threads.complete(id, NtStatus::SUCCESS, 0).is_err());
    assert!(threads.pending(slot).unwrap().is_empty());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_fifo_order_and_close_handle() {
    let threads = manager();
    let slot = threads.allocate().unwrap();
    let ids: Vec<_> = [1u32, 2, 1, 3]
        .iter()
        .map(|&handle| threads.alloc_fileio(slot, handle, 0, Box::new(|_| true)).unwrap())
        .collect();
    assert_eq!(threads.pending(slot).unwrap(), ids);

    assert_eq!(threads.close_handle(1), 2);
    assert_eq!(threads.pending(slot).unwrap(), vec![ids[1], ids[3]]);
    assert_eq!(threads.info(slot).unwrap().pending_io, 2);

    threads.release_fileio(ids[1]).unwrap();
    assert_eq!(threads.pending(slot).unwrap(), vec![ids[3]]);
    threads.free(slot).unwrap();
}
