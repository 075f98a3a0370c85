// SPDX-License-Identifier: Apache-2.0

//! Result-code taxonomy shared by the daemon and the client library.
//!
//! Codes cross the socket as a single `u32`: the low 16 bits carry the
//! major kind and the high 16 bits carry a detail word (an MCP subcode
//! for [`Error::Mcp`], an errno for [`Error::Kmod`]). [`Error::code`]
//! and [`Error::from_code`] round-trip this encoding.

use std::fmt;
use std::io;

/// Shorthand for results carrying a wire-codeable [`Error`].
pub type McResult<T> = Result<T, Error>;

/// Wire value reported for a successful operation.
pub const CODE_OK: u32 = 0;

const MAJOR_MASK: u32 = 0xFFFF;
const DETAIL_SHIFT: u32 = 16;

/// Everything a broker operation can report besides success.
///
/// Validation errors are handled locally and returned verbatim; socket
/// errors on a device channel remove the device; MCP domain errors are
/// returned without touching state (see the propagation policy in the
/// module docs of [`crate::device`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A parameter failed validation before any side effect.
    InvalidParameter,
    /// A required pointer argument was null.
    NullPointer,
    /// No open device with the given id.
    UnknownDevice,
    /// No session with the given id (or a bad NqConnect credential pair).
    UnknownSession,
    /// The device is already open in this process.
    DeviceAlreadyOpen,
    /// CloseDevice refused while sessions are still open.
    SessionPending,
    /// TCI length exceeds the compiled-in maximum.
    TciTooBig,
    /// TCI length exceeds the backing shared buffer.
    TciGreaterThanWsm,
    /// The user pointer does not resolve to a registered shared buffer.
    WsmNotFound,
    /// The secure virtual address does not resolve to a mapped bulk buffer.
    BulkBufferNotFound,
    /// Connecting to the daemon socket failed.
    SocketConnect,
    /// Writing to a daemon socket failed.
    SocketWrite,
    /// Reading from a daemon socket failed.
    SocketRead,
    /// A response had a length other than header or header+payload.
    SocketLength,
    /// The daemon reported an incompatible protocol version.
    DaemonVersion,
    /// The daemon rejected the request for an unspecified reason.
    DaemonUnreachable,
    /// No notification arrived within the requested time.
    Timeout,
    /// The notification channel was lost.
    Notification,
    /// A terminal notification was delivered; the exit code is stored on
    /// the session.
    InfoNotification,
    /// The operation is not implemented by this build.
    NotImplemented,
    /// The MCP transaction could not complete (secure world dead or the
    /// response was malformed).
    Mci,
    /// The kernel module has not been opened.
    KmodNotOpen,
    /// The kernel module reported an incompatible interface version.
    KmodVersion,
    /// The secure world rejected an MCP command.
    Mcp(McpError),
    /// A kernel driver call failed; carries the errno.
    Kmod(Errno),
    /// A wire code this build does not recognize.
    Unknown(u32),
}

impl Error {
    const fn major(&self) -> u32 {
        match self {
            Self::InvalidParameter => 0x01,
            Self::NullPointer => 0x02,
            Self::UnknownDevice => 0x03,
            Self::UnknownSession => 0x04,
            Self::DeviceAlreadyOpen => 0x05,
            Self::SessionPending => 0x06,
            Self::TciTooBig => 0x07,
            Self::TciGreaterThanWsm => 0x08,
            Self::WsmNotFound => 0x09,
            Self::BulkBufferNotFound => 0x0A,
            Self::SocketConnect => 0x0B,
            Self::SocketWrite => 0x0C,
            Self::SocketRead => 0x0D,
            Self::SocketLength => 0x0E,
            Self::DaemonVersion => 0x0F,
            Self::DaemonUnreachable => 0x10,
            Self::Timeout => 0x11,
            Self::Notification => 0x12,
            Self::InfoNotification => 0x13,
            Self::NotImplemented => 0x14,
            Self::Mci => 0x15,
            Self::KmodNotOpen => 0x16,
            Self::KmodVersion => 0x17,
            Self::Mcp(_) => 0x18,
            Self::Kmod(_) => 0x19,
            Self::Unknown(code) => *code & MAJOR_MASK,
        }
    }

    /// Encode for the wire.
    pub fn code(&self) -> u32 {
        let detail = match self {
            Self::Mcp(mcp) => mcp.detail() as u32,
            Self::Kmod(errno) => errno.0 as u32 & MAJOR_MASK,
            Self::Unknown(code) => *code >> DETAIL_SHIFT,
            _ => 0,
        };

        self.major() | detail << DETAIL_SHIFT
    }

    /// Decode a wire code; `None` means success.
    pub fn from_code(code: u32) -> Option<Self> {
        if code == CODE_OK {
            return None;
        }

        let detail = (code >> DETAIL_SHIFT) as u16;
        Some(match code & MAJOR_MASK {
            0x01 => Self::InvalidParameter,
            0x02 => Self::NullPointer,
            0x03 => Self::UnknownDevice,
            0x04 => Self::UnknownSession,
            0x05 => Self::DeviceAlreadyOpen,
            0x06 => Self::SessionPending,
            0x07 => Self::TciTooBig,
            0x08 => Self::TciGreaterThanWsm,
            0x09 => Self::WsmNotFound,
            0x0A => Self::BulkBufferNotFound,
            0x0B => Self::SocketConnect,
            0x0C => Self::SocketWrite,
            0x0D => Self::SocketRead,
            0x0E => Self::SocketLength,
            0x0F => Self::DaemonVersion,
            0x10 => Self::DaemonUnreachable,
            0x11 => Self::Timeout,
            0x12 => Self::Notification,
            0x13 => Self::InfoNotification,
            0x14 => Self::NotImplemented,
            0x15 => Self::Mci,
            0x16 => Self::KmodNotOpen,
            0x17 => Self::KmodVersion,
            0x18 => Self::Mcp(McpError::from_detail(detail)),
            0x19 => Self::Kmod(Errno(detail as i32)),
            _ => Self::Unknown(code),
        })
    }

    /// Wrap a driver I/O failure, preserving the errno.
    pub fn kmod(err: io::Error) -> Self {
        Self::Kmod(Errno(err.raw_os_error().unwrap_or(libc::EIO)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NullPointer => write!(f, "null pointer"),
            Self::UnknownDevice => write!(f, "unknown device"),
            Self::UnknownSession => write!(f, "unknown session"),
            Self::DeviceAlreadyOpen => write!(f, "device already open"),
            Self::SessionPending => write!(f, "sessions still open"),
            Self::TciTooBig => write!(f, "TCI exceeds maximum length"),
            Self::TciGreaterThanWsm => write!(f, "TCI larger than backing buffer"),
            Self::WsmNotFound => write!(f, "shared buffer not registered"),
            Self::BulkBufferNotFound => write!(f, "bulk buffer not mapped"),
            Self::SocketConnect => write!(f, "daemon socket connect failed"),
            Self::SocketWrite => write!(f, "daemon socket write failed"),
            Self::SocketRead => write!(f, "daemon socket read failed"),
            Self::SocketLength => write!(f, "response framing error"),
            Self::DaemonVersion => write!(f, "daemon version mismatch"),
            Self::DaemonUnreachable => write!(f, "daemon unreachable"),
            Self::Timeout => write!(f, "timed out"),
            Self::Notification => write!(f, "notification channel lost"),
            Self::InfoNotification => write!(f, "terminal notification received"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::Mci => write!(f, "secure world interface failure"),
            Self::KmodNotOpen => write!(f, "kernel module not open"),
            Self::KmodVersion => write!(f, "kernel module version mismatch"),
            Self::Mcp(mcp) => write!(f, "secure world rejected command: {mcp}"),
            Self::Kmod(errno) => write!(f, "kernel driver failure: {errno}"),
            Self::Unknown(code) => write!(f, "unknown result code {code:#010x}"),
        }
    }
}

impl std::error::Error for Error {}

/// MCP-level rejections the client may want to distinguish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McpError {
    WrongPublicKey,
    ContainerTypeMismatch,
    ContainerLocked,
    SpNoChild,
    TlNoChild,
    UnwrapRootFailed,
    UnwrapSpFailed,
    UnwrapTrustletFailed,
    /// An MCP code without a dedicated kind.
    Other(u16),
}

impl McpError {
    pub(crate) fn detail(self) -> u16 {
        match self {
            Self::WrongPublicKey => 1,
            Self::ContainerTypeMismatch => 2,
            Self::ContainerLocked => 3,
            Self::SpNoChild => 4,
            Self::TlNoChild => 5,
            Self::UnwrapRootFailed => 6,
            Self::UnwrapSpFailed => 7,
            Self::UnwrapTrustletFailed => 8,
            Self::Other(raw) => raw,
        }
    }

    pub(crate) fn from_detail(detail: u16) -> Self {
        match detail {
            1 => Self::WrongPublicKey,
            2 => Self::ContainerTypeMismatch,
            3 => Self::ContainerLocked,
            4 => Self::SpNoChild,
            5 => Self::TlNoChild,
            6 => Self::UnwrapRootFailed,
            7 => Self::UnwrapSpFailed,
            8 => Self::UnwrapTrustletFailed,
            raw => Self::Other(raw),
        }
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongPublicKey => write!(f, "wrong public key"),
            Self::ContainerTypeMismatch => write!(f, "container type mismatch"),
            Self::ContainerLocked => write!(f, "container locked"),
            Self::SpNoChild => write!(f, "service provider has no such child"),
            Self::TlNoChild => write!(f, "trustlet has no such child"),
            Self::UnwrapRootFailed => write!(f, "root container unwrap failed"),
            Self::UnwrapSpFailed => write!(f, "SP container unwrap failed"),
            Self::UnwrapTrustletFailed => write!(f, "trustlet container unwrap failed"),
            Self::Other(raw) => write!(f, "code {raw}"),
        }
    }
}

/// A raw errno captured from a failed driver call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}
