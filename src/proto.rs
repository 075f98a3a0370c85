// SPDX-License-Identifier: Apache-2.0

//! Client command wire protocol.
//!
//! Fixed-size little-endian structs over `SOCK_STREAM`. Every request
//! starts with a 32-bit command id; every response starts with a 32-bit
//! result code, optionally followed by a command-specific payload. The
//! per-session notification channel carries bare [`NotificationRecord`]s.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Largest TCI a client may hand to `open_session`.
pub const MAX_TCI_LEN: u32 = 0x0010_0000;

/// Daemon wire-protocol version, checked during the `GetVersion`
/// handshake.
pub const DAEMON_VERSION: u32 = make_version(0, 2);

/// Pack a `(major, minor)` pair the way every versioned interface of the
/// broker reports it.
pub const fn make_version(major: u16, minor: u16) -> u32 {
    (major as u32) << 16 | minor as u32
}

/// Same major, at least the required minor.
pub fn version_ok(required: u32, reported: u32) -> bool {
    reported >> 16 == required >> 16 && (reported & 0xFFFF) >= (required & 0xFFFF)
}

/// Render a packed version for diagnostics.
pub fn version_string(version: u32) -> String {
    format!("{}.{}", version >> 16, version & 0xFFFF)
}

/// Command ids accepted by the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Command {
    GetVersion = 0,
    OpenDevice = 1,
    CloseDevice = 2,
    OpenSession = 3,
    CloseSession = 4,
    NqConnect = 5,
    Notify = 6,
    MapBulkBuf = 7,
    UnmapBulkBuf = 8,
    GetMobicoreVersion = 9,
}

/// A Trustlet identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    /// Lower-case hex, the registry's file-name form.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({})", self.hex())
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Secure-world version report, cached by the daemon after the first MCP
/// query.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VersionInfo {
    pub product_id: [u8; 64],
    pub version_mci: u32,
    pub version_so: u32,
    pub version_mclf: u32,
    pub version_container: u32,
    pub version_mc_config: u32,
    pub version_tl_api: u32,
    pub version_dr_api: u32,
    pub version_cmp: u32,
}

impl fmt::Debug for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self
            .product_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.product_id.len());
        f.debug_struct("VersionInfo")
            .field("product_id", &String::from_utf8_lossy(&self.product_id[..end]))
            .field("mci", &version_string(self.version_mci))
            .field("tl_api", &version_string(self.version_tl_api))
            .field("dr_api", &version_string(self.version_dr_api))
            .finish()
    }
}

/// Every response begins with this.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ResponseHeader {
    pub result: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GetVersionCmd {
    pub cmd_id: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GetVersionRsp {
    pub version: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OpenDeviceCmd {
    pub cmd_id: u32,
    pub device_id: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CloseDeviceCmd {
    pub cmd_id: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OpenSessionCmd {
    pub cmd_id: u32,
    pub device_id: u32,
    pub uuid: Uuid,
    pub tci_handle: u32,
    pub tci_len: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OpenSessionRsp {
    pub session_id: u32,
    pub device_session_id: u32,
    pub session_magic: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CloseSessionCmd {
    pub cmd_id: u32,
    pub session_id: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NqConnectCmd {
    pub cmd_id: u32,
    pub device_id: u32,
    pub session_id: u32,
    pub device_session_id: u32,
    pub session_magic: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NotifyCmd {
    pub cmd_id: u32,
    pub session_id: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MapBulkCmd {
    pub cmd_id: u32,
    pub session_id: u32,
    pub client_virt: u64,
    pub len: u32,
    pub reserved: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MapBulkRsp {
    pub secure_virt: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UnmapBulkCmd {
    pub cmd_id: u32,
    pub session_id: u32,
    pub secure_virt: u32,
    pub len: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GetMobicoreVersionCmd {
    pub cmd_id: u32,
}

/// One record on a session's notification channel. `payload == 0` means
/// the session is runnable or produced output; anything else is a
/// terminal exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NotificationRecord {
    pub session_id: u32,
    pub payload: i32,
}
