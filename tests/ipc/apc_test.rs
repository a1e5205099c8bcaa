/*!
 * APC Tests
 * Cross-process system APCs, user APC delivery and coordinator kills
 */

use super::common::{apc_bytes, FakeCoordinator};
use bytes::BufMut;
use personality_kernel::core::NtStatus;
use personality_kernel::ipc::protocol::APC_RESULT_SIZE;
use personality_kernel::ipc::{
    ApcCall, ApcResult, IpcError, Opcode, SelectFields, SelectFlags, SelectOp, SelectOutcome, Timeout,
};
use pretty_assertions::assert_eq;
use std::thread;

fn queue_reply_fields(handle: u32, is_self: bool) -> Vec<u8> {
    let mut fields = Vec::new();
    fields.put_u32_le(handle);
    fields.put_u32_le(is_self as u32);
    fields
}

#[test]
fn test_queue_apc_to_other_process() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        let (header, data) = fake.next();
        assert_eq!(header.opcode, Opcode::QueueApc);
        assert_eq!(&header.fields[..4], &0x20u32.to_le_bytes());
        assert_eq!(
            ApcCall::decode(&mut &data[..]).unwrap(),
            ApcCall::AsyncIo { user: 9, status: NtStatus::SUCCESS }
        );
        fake.reply(NtStatus::SUCCESS, &queue_reply_fields(7, false), &[]);

        let (header, _) = fake.next();
        assert_eq!(header.opcode, Opcode::Select);
        fake.reply(NtStatus::WAIT_0, &[], &apc_bytes(ApcCall::None));

        let (header, _) = fake.next();
        assert_eq!(header.opcode, Opcode::GetApcResult);
        assert_eq!(&header.fields[..4], &7u32.to_le_bytes());
        let mut result = Vec::new();
        ApcResult::AsyncIo { status: NtStatus::SUCCESS, total: 4096 }.encode(&mut result);
        fake.reply(NtStatus::SUCCESS, &[], &result);

        let (header, _) = fake.next();
        assert_eq!(header.opcode, Opcode::CloseHandle);
        assert_eq!(&header.fields[..4], &7u32.to_le_bytes());
        fake.reply(NtStatus::SUCCESS, &[], &[]);
    });

    let result = session
        .queue_process_apc(0x20, &ApcCall::AsyncIo { user: 9, status: NtStatus::SUCCESS })
        .unwrap();
    server.join().unwrap();
    assert_eq!(result, ApcResult::AsyncIo { status: NtStatus::SUCCESS, total: 4096 });
}

#[test]
fn test_queue_apc_refused() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        fake.next();
        fake.reply(NtStatus::ACCESS_DENIED, &[], &[]);
    });
    let err = session
        .queue_process_apc(0x20, &ApcCall::AsyncIo { user: 1, status: NtStatus::SUCCESS })
        .unwrap_err();
    server.join().unwrap();
    assert_eq!(err, IpcError::Refused(NtStatus::ACCESS_DENIED));
    assert_eq!(NtStatus::from(&err), NtStatus::ACCESS_DENIED);
}

#[test]
fn test_user_apc_interrupts_alertable_wait() {
    let (session, mut fake) = FakeCoordinator::session();
    let call = ApcCall::User { func: 0x7000_1000, args: [4, 5, 6] };
    let server = thread::spawn(move || {
        let (header, _) = fake.next();
        assert!(SelectFields::decode(&header.fields).flags.contains(SelectFlags::ALERTABLE));
        fake.reply(NtStatus::USER_APC, &[], &apc_bytes(call));
    });
    let outcome = session
        .wait(&SelectOp::None, SelectFlags::ALERTABLE, Timeout::Infinite)
        .unwrap();
    server.join().unwrap();
    assert_eq!(outcome, SelectOutcome::UserApc(call));
    assert_eq!(outcome.status(), NtStatus::USER_APC);
}

#[test]
fn test_wake_without_user_apc() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        fake.next();
        fake.reply(NtStatus::USER_APC, &[], &apc_bytes(ApcCall::None));
    });
    let outcome = session
        .wait(&SelectOp::None, SelectFlags::ALERTABLE, Timeout::Infinite)
        .unwrap();
    server.join().unwrap();
    assert_eq!(outcome, SelectOutcome::Woken);
}

#[test]
fn test_killed_while_pending() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        fake.next();
        fake.reply(NtStatus::PENDING, &[], &[]);
        fake.wake(0, NtStatus::PROCESS_IS_TERMINATING.raw() as i32);
    });
    let err = session
        .wait(&SelectOp::None, SelectFlags::empty(), Timeout::Infinite)
        .unwrap_err();
    server.join().unwrap();
    assert_eq!(err, IpcError::Killed(NtStatus::PROCESS_IS_TERMINATING));
}

#[test]
fn test_user_apc_fetched_after_pending_wake() {
    let (session, mut fake) = FakeCoordinator::session();
    let call = ApcCall::User { func: 0x7000_2000, args: [7, 8, 9] };
    let server = thread::spawn(move || {
        let (header, data) = fake.next();
        let cookie = SelectFields::decode(&header.fields).cookie;
        assert_eq!(
            SelectOp::decode(&mut &data[APC_RESULT_SIZE..]).unwrap(),
            SelectOp::SignalAndWait { signal: 2, wait: 5 }
        );
        fake.reply(NtStatus::PENDING, &[], &[]);
        fake.wake(cookie, NtStatus::USER_APC.raw() as i32);

        let (header, data) = fake.next();
        assert_eq!(header.opcode, Opcode::Select);
        assert_eq!(SelectFields::decode(&header.fields).cookie, cookie);
        assert_eq!(
            SelectOp::decode(&mut &data[APC_RESULT_SIZE..]).unwrap(),
            SelectOp::Wait { handles: vec![5], all: false }
        );
        fake.reply(NtStatus::USER_APC, &[], &apc_bytes(call));
    });
    let outcome = session
        .wait(&SelectOp::SignalAndWait { signal: 2, wait: 5 }, SelectFlags::ALERTABLE, Timeout::Infinite)
        .unwrap();
    server.join().unwrap();
    assert_eq!(outcome, SelectOutcome::UserApc(call));
}
