/*!
 * IPC Module
 * Coordinator session: wire protocol, per-thread channel and client calls
 */

pub mod channel;
pub mod client;
pub mod protocol;
pub mod types;

pub use channel::{ChannelFds, CoordinatorChannel, CoordinatorEnds, FdChannel, UninterruptedSection};
pub use client::SessionClient;
pub use protocol::{
    ApcCall, ApcResult, AsyncDescriptor, CompletionRecord, Opcode, Reply, ReplyHeader, Request,
    RequestHeader, SelectFields, SelectFlags, SelectOp, SystemApcHandler, WakeUpReply,
};
pub use types::{IpcError, IpcResult, SelectOutcome, Timeout, MAXIMUM_WAIT_OBJECTS};
