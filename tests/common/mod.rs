/*!
 * Shared Test Fixtures
 * Scripted guest dispatcher and an in-process fake coordinator
 */

#![allow(dead_code)]

use personality_kernel::context::TranslatedContext;
use personality_kernel::core::limits::REQUEST_HEADER_SIZE;
use personality_kernel::ipc::{
    ApcCall, CoordinatorChannel, CoordinatorEnds, FdChannel, ReplyHeader, RequestHeader, SessionClient,
    WakeUpReply,
};
use personality_kernel::signals::{
    CallbackReturn, CtrlEvent, ExceptionDisposition, ExceptionRecord, GuestDispatcher, SyscallArgs,
};
use personality_kernel::NtStatus;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;

/// Guest dispatcher with canned answers that records what it saw
#[derive(Default)]
pub struct ScriptedDispatcher {
    pub handles_exceptions: bool,
    pub syscall_status: Mutex<Option<NtStatus>>,
    pub exceptions: Mutex<Vec<(NtStatus, bool)>>,
    pub syscalls: Mutex<Vec<SyscallArgs>>,
    pub apcs: Mutex<Vec<(u64, [u64; 3])>>,
    pub started: Mutex<Vec<(u64, u64)>>,
    pub ctrl_events: Mutex<Vec<CtrlEvent>>,
    /// Host signal raised from inside the guest start routine
    pub raise_in_start: Option<i32>,
}

impl ScriptedDispatcher {
    pub fn handling() -> Self {
        Self {
            handles_exceptions: true,
            ..Self::default()
        }
    }
}

impl GuestDispatcher for ScriptedDispatcher {
    fn dispatch_exception(
        &self,
        record: &ExceptionRecord,
        _ctx: &mut TranslatedContext,
        first_chance: bool,
    ) -> ExceptionDisposition {
        self.exceptions.lock().push((record.code, first_chance));
        if self.handles_exceptions {
            ExceptionDisposition::ContinueExecution
        } else {
            ExceptionDisposition::ContinueSearch
        }
    }

    fn raise_user_exception(&self, record: &ExceptionRecord, ctx: &mut TranslatedContext) -> ExceptionDisposition {
        self.dispatch_exception(record, ctx, true)
    }

    fn dispatch_apc(&self, func: u64, args: [u64; 3], _ctx: &mut TranslatedContext) {
        self.apcs.lock().push((func, args));
    }

    fn dispatch_syscall(&self, args: &SyscallArgs) -> NtStatus {
        self.syscalls.lock().push(*args);
        (*self.syscall_status.lock()).unwrap_or(NtStatus::SUCCESS)
    }

    fn start_thread(&self, entry: u64, arg: u64, _ctx: &mut TranslatedContext) -> NtStatus {
        self.started.lock().push((entry, arg));
        if let Some(signal) = self.raise_in_start {
            // SAFETY: delivered to this thread before raise returns
            unsafe { libc::raise(signal) };
        }
        NtStatus(arg as u32)
    }

    fn user_callback(&self, id: u32, args: &[u8]) -> CallbackReturn {
        let mut data = args.to_vec();
        data.reverse();
        CallbackReturn {
            status: NtStatus(id),
            data: data.into(),
        }
    }

    fn ctrl_routine(&self, event: CtrlEvent) -> NtStatus {
        self.ctrl_events.lock().push(event);
        match event {
            CtrlEvent::CtrlC => NtStatus::SUCCESS,
            CtrlEvent::CtrlBreak => NtStatus::UNSUCCESSFUL,
        }
    }
}

/// Coordinator end of a session, driven step by step from a test thread
pub struct FakeCoordinator {
    ends: CoordinatorEnds,
    wait_tx: RawFd,
}

impl FakeCoordinator {
    pub fn session() -> (Arc<SessionClient>, FakeCoordinator) {
        let (channel, ends) = FdChannel::pair().expect("socket pairs");
        let wait_tx = channel.fds().wait[1];
        let client = Arc::new(SessionClient::new(Box::new(channel)));
        (client, FakeCoordinator { ends, wait_tx })
    }

    /// Read the next request
    pub fn next(&mut self) -> (RequestHeader, Vec<u8>) {
        let mut raw = [0u8; REQUEST_HEADER_SIZE];
        self.ends.request.read_exact(&mut raw).expect("request header");
        let header = RequestHeader::decode(&raw).expect("known opcode");
        let mut data = vec![0u8; header.data_size as usize];
        self.ends.request.read_exact(&mut data).expect("request data");
        (header, data)
    }

    pub fn reply(&mut self, status: NtStatus, fields: &[u8], data: &[u8]) {
        let mut header = ReplyHeader::new(status);
        header.fields[..fields.len()].copy_from_slice(fields);
        header.data_size = data.len() as u32;
        self.ends.reply.write_all(&header.encode()).expect("reply header");
        self.ends.reply.write_all(data).expect("reply data");
    }

    /// Post a wake-up record on the wait pipe
    pub fn wake(&self, cookie: u64, signaled: i32) {
        let raw = WakeUpReply { cookie, signaled }.encode();
        // SAFETY: the descriptor stays open while the session lives
        let written = unsafe { libc::write(self.wait_tx, raw.as_ptr().cast(), raw.len()) };
        assert_eq!(written, raw.len() as isize);
    }
}

pub fn apc_bytes(call: ApcCall) -> Vec<u8> {
    let mut data = Vec::new();
    call.encode(&mut data);
    data
}
