/*!
 * Guest Status Codes
 * The per-operation status values guest dispatchers expect
 */

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Guest status value
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const WAIT_0: Self = Self(0x0000_0000);
    pub const ABANDONED_WAIT_0: Self = Self(0x0000_0080);
    pub const USER_APC: Self = Self(0x0000_00c0);
    pub const KERNEL_APC: Self = Self(0x0000_0100);
    pub const ALERTED: Self = Self(0x0000_0101);
    pub const TIMEOUT: Self = Self(0x0000_0102);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const MORE_PROCESSING_REQUIRED: Self = Self(0xc000_0016);

    pub const GUARD_PAGE_VIOLATION: Self = Self(0x8000_0001);
    pub const BREAKPOINT: Self = Self(0x8000_0003);
    pub const SINGLE_STEP: Self = Self(0x8000_0004);
    pub const BUFFER_OVERFLOW: Self = Self(0x8000_0005);

    pub const UNSUCCESSFUL: Self = Self(0xc000_0001);
    pub const NOT_IMPLEMENTED: Self = Self(0xc000_0002);
    pub const ACCESS_VIOLATION: Self = Self(0xc000_0005);
    pub const INVALID_HANDLE: Self = Self(0xc000_0008);
    pub const INVALID_PARAMETER: Self = Self(0xc000_000d);
    pub const NO_SUCH_DEVICE: Self = Self(0xc000_000e);
    pub const INVALID_DEVICE_REQUEST: Self = Self(0xc000_0010);
    pub const NO_MEMORY: Self = Self(0xc000_0017);
    pub const CONFLICTING_ADDRESSES: Self = Self(0xc000_0018);
    pub const INVALID_SYSTEM_SERVICE: Self = Self(0xc000_001c);
    pub const ILLEGAL_INSTRUCTION: Self = Self(0xc000_001d);
    pub const ACCESS_DENIED: Self = Self(0xc000_0022);
    pub const OBJECT_NAME_NOT_FOUND: Self = Self(0xc000_0034);
    pub const OBJECT_PATH_NOT_FOUND: Self = Self(0xc000_003a);
    pub const SHARING_VIOLATION: Self = Self(0xc000_0043);
    pub const DISK_FULL: Self = Self(0xc000_007f);
    pub const FLOAT_DENORMAL_OPERAND: Self = Self(0xc000_008d);
    pub const FLOAT_DIVIDE_BY_ZERO: Self = Self(0xc000_008e);
    pub const FLOAT_INEXACT_RESULT: Self = Self(0xc000_008f);
    pub const FLOAT_INVALID_OPERATION: Self = Self(0xc000_0090);
    pub const FLOAT_OVERFLOW: Self = Self(0xc000_0091);
    pub const FLOAT_STACK_CHECK: Self = Self(0xc000_0092);
    pub const FLOAT_UNDERFLOW: Self = Self(0xc000_0093);
    pub const INTEGER_DIVIDE_BY_ZERO: Self = Self(0xc000_0094);
    pub const INTEGER_OVERFLOW: Self = Self(0xc000_0095);
    pub const PRIVILEGED_INSTRUCTION: Self = Self(0xc000_0096);
    pub const ARRAY_BOUNDS_EXCEEDED: Self = Self(0xc000_008c);
    pub const DATATYPE_MISALIGNMENT: Self = Self(0x8000_0002);
    pub const IN_PAGE_ERROR: Self = Self(0xc000_0006);
    pub const INVALID_IMAGE_FORMAT: Self = Self(0xc000_007b);
    pub const DEVICE_NOT_READY: Self = Self(0xc000_00a3);
    pub const PIPE_DISCONNECTED: Self = Self(0xc000_00b0);
    pub const NOT_SUPPORTED: Self = Self(0xc000_00bb);
    pub const DEVICE_BUSY: Self = Self(0xc000_00ae);
    pub const STACK_OVERFLOW: Self = Self(0xc000_00fd);
    pub const DIRECTORY_NOT_EMPTY: Self = Self(0xc000_0101);
    pub const PROCESS_IS_TERMINATING: Self = Self(0xc000_010a);
    pub const TOO_MANY_OPENED_FILES: Self = Self(0xc000_011f);
    pub const TOO_MANY_THREADS: Self = Self(0xc000_0129);
    pub const CONTROL_C_EXIT: Self = Self(0xc000_013a);
    pub const ILLEGAL_FUNCTION: Self = Self(0xc000_00af);
    pub const NONCONTINUABLE_EXCEPTION: Self = Self(0xc000_0025);
    pub const INVALID_DISPOSITION: Self = Self(0xc000_0026);
    pub const UNHANDLED_EXCEPTION: Self = Self(0xc000_0144);

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Success and informational codes
    #[inline]
    pub const fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    /// Error severity codes (top two bits set)
    #[inline]
    pub const fn is_error(self) -> bool {
        (self.0 >> 30) == 3
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NtStatus(0x{:08x})", self.0)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for NtStatus {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Map a host errno to the closest guest status
pub fn errno_to_status(err: Errno) -> NtStatus {
    match err {
        Errno::EAGAIN => NtStatus::SHARING_VIOLATION,
        Errno::EBADF => NtStatus::INVALID_HANDLE,
        Errno::EBUSY => NtStatus::DEVICE_BUSY,
        Errno::ENOSPC => NtStatus::DISK_FULL,
        Errno::EPERM | Errno::EROFS | Errno::EACCES => NtStatus::ACCESS_DENIED,
        Errno::ENOTDIR => NtStatus::OBJECT_PATH_NOT_FOUND,
        Errno::ENOENT => NtStatus::OBJECT_NAME_NOT_FOUND,
        Errno::EISDIR => NtStatus::INVALID_DEVICE_REQUEST,
        Errno::EMFILE | Errno::ENFILE => NtStatus::TOO_MANY_OPENED_FILES,
        Errno::EINVAL => NtStatus::INVALID_PARAMETER,
        Errno::ENOTEMPTY => NtStatus::DIRECTORY_NOT_EMPTY,
        Errno::EPIPE | Errno::ECONNRESET => NtStatus::PIPE_DISCONNECTED,
        Errno::EIO => NtStatus::DEVICE_NOT_READY,
        Errno::ENXIO => NtStatus::NO_SUCH_DEVICE,
        Errno::ENOTTY | Errno::EOPNOTSUPP => NtStatus::NOT_SUPPORTED,
        Errno::EFAULT => NtStatus::ACCESS_VIOLATION,
        Errno::ESPIPE => NtStatus::ILLEGAL_FUNCTION,
        Errno::ENOEXEC => NtStatus::INVALID_IMAGE_FORMAT,
        Errno::ENOMEM => NtStatus::NO_MEMORY,
        _ => NtStatus::UNSUCCESSFUL,
    }
}
