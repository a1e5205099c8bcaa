/*!
 * Select Tests
 * Zero-timeout polls, context exchange and coordinator loss
 */

use super::common::{apc_bytes, FakeCoordinator};
use personality_kernel::context::{
    to_wire, Amd64Context, ContextFlags, NativeContext, TranslatedContext, WireContext, WIRE_CONTEXT_SIZE,
};
use personality_kernel::core::{Machine, NtStatus};
use personality_kernel::ipc::protocol::APC_RESULT_SIZE;
use personality_kernel::ipc::{
    ApcCall, Opcode, SelectFields, SelectFlags, SelectOp, SelectOutcome, Timeout,
};
use pretty_assertions::assert_eq;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_zero_timeout_select_returns_immediately() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        let (header, data) = fake.next();
        assert_eq!(header.opcode, Opcode::Select);
        let fields = SelectFields::decode(&header.fields);
        assert_eq!(fields.timeout, 0);
        assert_eq!(Timeout::from_wire(fields.timeout), Timeout::POLL);
        let op = SelectOp::decode(&mut &data[APC_RESULT_SIZE..]).unwrap();
        assert_eq!(op, SelectOp::Wait { handles: vec![12], all: false });
        fake.reply(NtStatus::TIMEOUT, &[], &apc_bytes(ApcCall::None));
    });

    let started = Instant::now();
    let outcome = session
        .wait(&SelectOp::Wait { handles: vec![12], all: false }, SelectFlags::empty(), Timeout::POLL)
        .unwrap();
    server.join().unwrap();

    assert_eq!(outcome, SelectOutcome::Timeout);
    assert_eq!(outcome.status(), NtStatus::TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!session.is_in_call());
}

#[test]
fn test_signaled_object_index() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        fake.next();
        fake.reply(NtStatus(2), &[], &apc_bytes(ApcCall::None));
        fake.next();
        fake.reply(NtStatus(NtStatus::ABANDONED_WAIT_0.raw() + 1), &[], &apc_bytes(ApcCall::None));
    });
    let op = SelectOp::Wait { handles: vec![1, 2, 3], all: false };
    assert_eq!(
        session.wait(&op, SelectFlags::empty(), Timeout::Infinite).unwrap(),
        SelectOutcome::Satisfied(2)
    );
    assert_eq!(
        session.wait(&op, SelectFlags::empty(), Timeout::Infinite).unwrap(),
        SelectOutcome::Abandoned(1)
    );
    server.join().unwrap();
}

#[test]
fn test_pending_select_completes_on_wake() {
    let (session, mut fake) = FakeCoordinator::session();
    let server = thread::spawn(move || {
        let (header, _) = fake.next();
        let cookie = SelectFields::decode(&header.fields).cookie;
        fake.reply(NtStatus::PENDING, &[], &[]);
        thread::sleep(Duration::from_millis(10));
        fake.wake(cookie, NtStatus::ALERTED.raw() as i32);
    });
    let outcome = session
        .wait(&SelectOp::None, SelectFlags::ALERTABLE, Timeout::Infinite)
        .unwrap();
    assert_eq!(outcome, SelectOutcome::Alerted);
    server.join().unwrap();
}

#[test]
fn test_context_exchanged_with_select() {
    let (session, mut fake) = FakeCoordinator::session();
    let mut native = Amd64Context {
        rip: 0x1000,
        rsp: 0x8000,
        ..Default::default()
    };
    native.set_groups(ContextFlags::CONTROL);
    let ctx = TranslatedContext::new(NativeContext::Amd64(native), false);
    let mut wire = to_wire(&ctx, Machine::Amd64).unwrap();

    let server = thread::spawn(move || {
        let (header, data) = fake.next();
        let fields = SelectFields::decode(&header.fields);
        assert_eq!(fields.context_size as usize, WIRE_CONTEXT_SIZE);
        let sent = WireContext::decode(&data[data.len() - WIRE_CONTEXT_SIZE..]).unwrap();
        let mut changed = sent;
        if let personality_kernel::context::WireRegs::Amd64(regs) = &mut changed.regs {
            regs.rip = 0x2000;
        }
        let mut reply = apc_bytes(ApcCall::None);
        reply.extend_from_slice(&changed.encode());
        fake.reply(NtStatus::WAIT_0, &[], &reply);
    });

    let outcome = session
        .select(&SelectOp::None, SelectFlags::empty(), Timeout::POLL, Some(&mut wire))
        .unwrap();
    server.join().unwrap();

    assert_eq!(outcome, SelectOutcome::Satisfied(0));
    let personality_kernel::context::WireRegs::Amd64(regs) = wire.regs else {
        panic!("machine changed");
    };
    assert_eq!(regs.rip, 0x2000);
    assert_eq!(regs.rsp, 0x8000);
}

#[test]
fn test_coordinator_loss_is_disconnect() {
    let (session, fake) = FakeCoordinator::session();
    drop(fake);
    let err = session
        .wait(&SelectOp::None, SelectFlags::empty(), Timeout::POLL)
        .unwrap_err();
    assert!(err.is_unreachable());
    assert_eq!(NtStatus::from(&err), NtStatus::PIPE_DISCONNECTED);
}
