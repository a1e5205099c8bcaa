/*!
 * Coordinator Channel
 * Per-thread descriptors carrying requests, replies and wake-up records
 */

use super::protocol::WakeUpReply;
use super::types::{IpcError, IpcResult};
use crate::core::limits::{REQUEST_HEADER_SIZE, WAKE_UP_REPLY_SIZE};
use nix::errno::Errno;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Raw descriptors of one channel, as recorded in the thread data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFds {
    pub request: RawFd,
    pub reply: RawFd,
    /// Read and write ends of the wait pipe
    pub wait: [RawFd; 2],
}

/// Transport used by a session
#[cfg_attr(test, mockall::automock)]
pub trait CoordinatorChannel: Send + Sync {
    /// Write one request header and its variable data
    fn send(&self, header: &[u8; REQUEST_HEADER_SIZE], data: &[u8]) -> IpcResult<()>;

    /// Fill `buf` from the reply descriptor
    fn recv(&self, buf: &mut [u8]) -> IpcResult<()>;

    /// Block on the wait descriptor for the next wake-up record
    fn recv_wake(&self) -> IpcResult<WakeUpReply>;

    fn fds(&self) -> ChannelFds;
}

/// Channel over host file descriptors
#[derive(Debug)]
pub struct FdChannel {
    request: OwnedFd,
    reply: OwnedFd,
    wait: [OwnedFd; 2],
}

impl FdChannel {
    pub fn new(request: OwnedFd, reply: OwnedFd, wait: [OwnedFd; 2]) -> Self {
        Self { request, reply, wait }
    }

    /// Channel plus the coordinator ends of each socket pair
    pub fn pair() -> IpcResult<(Self, CoordinatorEnds)> {
        let (request, request_peer) = UnixStream::pair().map_err(io_errno)?;
        let (reply, reply_peer) = UnixStream::pair().map_err(io_errno)?;
        let (wait_rx, wait_tx) = UnixStream::pair().map_err(io_errno)?;
        let channel = Self::new(request.into(), reply.into(), [wait_rx.into(), wait_tx.into()]);
        let ends = CoordinatorEnds {
            request: request_peer,
            reply: reply_peer,
        };
        Ok((channel, ends))
    }
}

/// Coordinator side of a channel created by [`FdChannel::pair`]
///
/// Wake-up records are written to the wait pipe through the channel's own
/// write end, which the coordinator receives as `fds().wait[1]`.
#[derive(Debug)]
pub struct CoordinatorEnds {
    pub request: UnixStream,
    pub reply: UnixStream,
}

impl CoordinatorChannel for FdChannel {
    fn send(&self, header: &[u8; REQUEST_HEADER_SIZE], data: &[u8]) -> IpcResult<()> {
        write_all(self.request.as_raw_fd(), header)?;
        if !data.is_empty() {
            write_all(self.request.as_raw_fd(), data)?;
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> IpcResult<()> {
        read_exact(self.reply.as_raw_fd(), buf)
    }

    fn recv_wake(&self) -> IpcResult<WakeUpReply> {
        let mut raw = [0u8; WAKE_UP_REPLY_SIZE];
        read_exact(self.wait[0].as_raw_fd(), &mut raw)?;
        Ok(WakeUpReply::decode(&raw))
    }

    fn fds(&self) -> ChannelFds {
        ChannelFds {
            request: self.request.as_raw_fd(),
            reply: self.reply.as_raw_fd(),
            wait: [self.wait[0].as_raw_fd(), self.wait[1].as_raw_fd()],
        }
    }
}

/// Write the whole buffer, retrying on EINTR
///
/// Uses raw `write(2)` so the path stays allocation free.
pub(crate) fn write_all(fd: RawFd, mut buf: &[u8]) -> IpcResult<()> {
    while !buf.is_empty() {
        // SAFETY: buf is a live slice and fd is owned by the caller
        let written = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        match written {
            n if n > 0 => buf = &buf[n as usize..],
            0 => return Err(IpcError::Disconnected),
            _ => match Errno::last() {
                Errno::EINTR => continue,
                Errno::EPIPE => return Err(IpcError::Disconnected),
                errno => return Err(IpcError::Io(errno)),
            },
        }
    }
    Ok(())
}

/// Fill the whole buffer, retrying on EINTR; end of stream is a disconnect
pub(crate) fn read_exact(fd: RawFd, mut buf: &mut [u8]) -> IpcResult<()> {
    while !buf.is_empty() {
        // SAFETY: buf is a live mutable slice and fd is owned by the caller
        let read = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        match read {
            n if n > 0 => buf = &mut buf[n as usize..],
            0 => return Err(IpcError::Disconnected),
            _ => match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(IpcError::Io(errno)),
            },
        }
    }
    Ok(())
}

fn io_errno(err: std::io::Error) -> IpcError {
    err.raw_os_error()
        .map_or(IpcError::Disconnected, |code| IpcError::Io(Errno::from_raw(code)))
}

/// Signals that must not interrupt a request/reply exchange
pub fn server_block_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGCHLD,
        Signal::SIGIO,
        Signal::SIGALRM,
        Signal::SIGTERM,
        Signal::SIGQUIT,
    ] {
        set.add(signal);
    }
    set
}

/// Blocks the server signal set until dropped
///
/// Suspend requests arrive as signals and issue their own coordinator
/// calls, so they are held off while this thread is mid-exchange.
#[must_use = "signals are unblocked when the section is dropped"]
pub struct UninterruptedSection {
    previous: SigSet,
}

impl UninterruptedSection {
    pub fn enter() -> IpcResult<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&server_block_set()), Some(&mut previous))
            .map_err(IpcError::Io)?;
        Ok(Self { previous })
    }
}

impl Drop for UninterruptedSection {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}
