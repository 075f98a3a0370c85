// SPDX-License-Identifier: Apache-2.0

//! The MobiCore Protocol: one request/response at a time through the
//! fixed message region of the MCI.
//!
//! A transaction writes the command fields, publishes a notification for
//! [`super::SID_MCP`] into the NWd→MC queue, triggers scheduling and then
//! waits for the IRQ loop to signal the MCP notification. Serialization
//! of transactions is the device's job (one lock held across
//! request+response); this type only knows the message layout and the
//! wakeup protocol.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Error, McResult, McpError};
use crate::mci::{MciRegion, MCP_MESSAGE_OFFSET};
use crate::proto::{Uuid, VersionInfo};

/// Set on the message id when the secure world has written a response.
pub const FLAG_RESPONSE: u32 = 1 << 31;

/// Secure-world success code.
pub const MCP_RET_OK: u32 = 0;

pub const MCP_RET_ERR_WRONG_PUBLIC_KEY: u32 = 6;
pub const MCP_RET_ERR_CONTAINER_TYPE_MISMATCH: u32 = 7;
pub const MCP_RET_ERR_CONTAINER_LOCKED: u32 = 8;
pub const MCP_RET_ERR_SP_NO_CHILD: u32 = 9;
pub const MCP_RET_ERR_TL_NO_CHILD: u32 = 10;
pub const MCP_RET_ERR_UNWRAP_ROOT_FAILED: u32 = 11;
pub const MCP_RET_ERR_UNWRAP_SP_FAILED: u32 = 12;
pub const MCP_RET_ERR_UNWRAP_TRUSTLET_FAILED: u32 = 13;

/// MCP command ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum McpCmd {
    OpenSession = 1,
    CloseSession = 2,
    Map = 3,
    Unmap = 4,
    GetVersion = 5,
}

/// Field offsets inside the MCP message, relative to the message start.
pub mod layout {
    /// Command id, or command id | `FLAG_RESPONSE`.
    pub const ID: usize = 0;
    /// Secure-world result code of a response.
    pub const RSP_RESULT: usize = 4;

    pub const OPEN_UUID: usize = 4;
    pub const OPEN_TCI_PHYS: usize = 20;
    pub const OPEN_TCI_LEN: usize = 28;
    pub const OPEN_BLOB_PHYS: usize = 32;
    pub const OPEN_BLOB_OFFSET: usize = 40;
    pub const OPEN_BLOB_LEN: usize = 44;
    pub const OPEN_RSP_SESSION_ID: usize = 8;

    pub const CLOSE_SESSION_ID: usize = 4;

    pub const MAP_SESSION_ID: usize = 4;
    pub const MAP_TABLE_PHYS: usize = 8;
    pub const MAP_OFFSET: usize = 16;
    pub const MAP_LEN: usize = 20;
    pub const MAP_RSP_SECURE_VIRT: usize = 8;

    pub const UNMAP_SESSION_ID: usize = 4;
    pub const UNMAP_SECURE_VIRT: usize = 8;
    pub const UNMAP_LEN: usize = 12;

    pub const VERSION_RSP_INFO: usize = 8;
}

/// Map a recognized MCP rejection to its taxonomy kind; everything else
/// collapses to the generic MCP error.
pub fn domain_error(raw: u32) -> Error {
    Error::Mcp(match raw {
        MCP_RET_ERR_WRONG_PUBLIC_KEY => McpError::WrongPublicKey,
        MCP_RET_ERR_CONTAINER_TYPE_MISMATCH => McpError::ContainerTypeMismatch,
        MCP_RET_ERR_CONTAINER_LOCKED => McpError::ContainerLocked,
        MCP_RET_ERR_SP_NO_CHILD => McpError::SpNoChild,
        MCP_RET_ERR_TL_NO_CHILD => McpError::TlNoChild,
        MCP_RET_ERR_UNWRAP_ROOT_FAILED => McpError::UnwrapRootFailed,
        MCP_RET_ERR_UNWRAP_SP_FAILED => McpError::UnwrapSpFailed,
        MCP_RET_ERR_UNWRAP_TRUSTLET_FAILED => McpError::UnwrapTrustletFailed,
        other => McpError::Other(other as u16),
    })
}

/// Outcome of waiting for the MCP notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McpWait {
    Signalled,
    TimedOut,
    /// The IRQ loop is gone; no response will ever arrive.
    Exiting,
}

#[derive(Default)]
struct WaitState {
    signalled: bool,
    exiting: bool,
}

/// Typed access to the MCP message plus the notification condition the
/// IRQ loop signals.
pub struct McpChannel {
    mci: MciRegion,
    msg: usize,
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl McpChannel {
    pub fn new(mci: MciRegion) -> Self {
        Self {
            mci,
            msg: MCP_MESSAGE_OFFSET,
            state: Mutex::new(WaitState::default()),
            cv: Condvar::new(),
        }
    }

    pub fn write_open_session(
        &self,
        uuid: &Uuid,
        tci_phys: u64,
        tci_len: u32,
        blob_phys: u64,
        blob_offset: u32,
        blob_len: u32,
    ) {
        let m = self.msg;
        self.mci.write_bytes(m + layout::OPEN_UUID, uuid.as_bytes());
        self.mci.write_u64(m + layout::OPEN_TCI_PHYS, tci_phys);
        self.mci.write_u32(m + layout::OPEN_TCI_LEN, tci_len);
        self.mci.write_u64(m + layout::OPEN_BLOB_PHYS, blob_phys);
        self.mci.write_u32(m + layout::OPEN_BLOB_OFFSET, blob_offset);
        self.mci.write_u32(m + layout::OPEN_BLOB_LEN, blob_len);
        self.mci.write_u32(m + layout::ID, McpCmd::OpenSession.into());
    }

    pub fn read_open_session_rsp(&self) -> McResult<u32> {
        self.response(McpCmd::OpenSession)?;
        Ok(self.mci.read_u32(self.msg + layout::OPEN_RSP_SESSION_ID))
    }

    pub fn write_close_session(&self, session_id: u32) {
        self.mci
            .write_u32(self.msg + layout::CLOSE_SESSION_ID, session_id);
        self.mci
            .write_u32(self.msg + layout::ID, McpCmd::CloseSession.into());
    }

    pub fn read_close_session_rsp(&self) -> McResult<()> {
        self.response(McpCmd::CloseSession)
    }

    pub fn write_map(&self, session_id: u32, table_phys: u64, offset: u32, len: u32) {
        let m = self.msg;
        self.mci.write_u32(m + layout::MAP_SESSION_ID, session_id);
        self.mci.write_u64(m + layout::MAP_TABLE_PHYS, table_phys);
        self.mci.write_u32(m + layout::MAP_OFFSET, offset);
        self.mci.write_u32(m + layout::MAP_LEN, len);
        self.mci.write_u32(m + layout::ID, McpCmd::Map.into());
    }

    pub fn read_map_rsp(&self) -> McResult<u32> {
        self.response(McpCmd::Map)?;
        Ok(self.mci.read_u32(self.msg + layout::MAP_RSP_SECURE_VIRT))
    }

    pub fn write_unmap(&self, session_id: u32, secure_virt: u32, len: u32) {
        let m = self.msg;
        self.mci.write_u32(m + layout::UNMAP_SESSION_ID, session_id);
        self.mci.write_u32(m + layout::UNMAP_SECURE_VIRT, secure_virt);
        self.mci.write_u32(m + layout::UNMAP_LEN, len);
        self.mci.write_u32(m + layout::ID, McpCmd::Unmap.into());
    }

    pub fn read_unmap_rsp(&self) -> McResult<()> {
        self.response(McpCmd::Unmap)
    }

    pub fn write_get_version(&self) {
        self.mci
            .write_u32(self.msg + layout::ID, McpCmd::GetVersion.into());
    }

    pub fn read_get_version_rsp(&self) -> McResult<VersionInfo> {
        self.response(McpCmd::GetVersion)?;
        let mut raw = [0u8; std::mem::size_of::<VersionInfo>()];
        self.mci
            .read_bytes(self.msg + layout::VERSION_RSP_INFO, &mut raw);
        VersionInfo::read_from_bytes(&raw).map_err(|_| Error::Mci)
    }

    fn response(&self, cmd: McpCmd) -> McResult<()> {
        let id = self.mci.read_u32(self.msg + layout::ID);
        if id != u32::from(cmd) | FLAG_RESPONSE {
            // Something is messing with the MCI memory; whatever the
            // secure world did, we lost track of it.
            return Err(Error::Mci);
        }

        match self.mci.read_u32(self.msg + layout::RSP_RESULT) {
            MCP_RET_OK => Ok(()),
            raw => Err(domain_error(raw)),
        }
    }

    /// Wake the in-flight transaction; called by the IRQ loop on an
    /// MCP-session notification.
    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.signalled = true;
        self.cv.notify_all();
    }

    /// Fail the in-flight transaction and every later one; called when
    /// the IRQ loop exits.
    pub fn set_exiting(&self) {
        let mut state = self.state.lock().unwrap();
        state.exiting = true;
        self.cv.notify_all();
    }

    /// Block until signalled, the channel dies, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> McpWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.exiting {
                return McpWait::Exiting;
            }
            if state.signalled {
                state.signalled = false;
                return McpWait::Signalled;
            }

            let now = Instant::now();
            if now >= deadline {
                return McpWait::TimedOut;
            }
            let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mci::MCI_BUFFER_SIZE;

    fn channel(backing: &mut Vec<u8>) -> (McpChannel, MciRegion) {
        let mci = unsafe { MciRegion::new(backing.as_mut_ptr(), backing.len()) };
        (McpChannel::new(mci), mci)
    }

    #[test]
    fn open_session_round_trip() {
        let mut backing = vec![0u8; MCI_BUFFER_SIZE];
        let (mcp, mci) = channel(&mut backing);

        let uuid = Uuid([7u8; 16]);
        mcp.write_open_session(&uuid, 0x1000, 256, 0x2000, 0x40, 4096);
        assert_eq!(
            mci.read_u32(MCP_MESSAGE_OFFSET + layout::ID),
            u32::from(McpCmd::OpenSession)
        );
        assert_eq!(mci.read_u64(MCP_MESSAGE_OFFSET + layout::OPEN_TCI_PHYS), 0x1000);

        // The "secure world" answers.
        mci.write_u32(MCP_MESSAGE_OFFSET + layout::OPEN_RSP_SESSION_ID, 42);
        mci.write_u32(MCP_MESSAGE_OFFSET + layout::RSP_RESULT, MCP_RET_OK);
        mci.write_u32(
            MCP_MESSAGE_OFFSET + layout::ID,
            u32::from(McpCmd::OpenSession) | FLAG_RESPONSE,
        );

        assert_eq!(mcp.read_open_session_rsp().unwrap(), 42);
    }

    #[test]
    fn wrong_response_id_is_an_interface_failure() {
        let mut backing = vec![0u8; MCI_BUFFER_SIZE];
        let (mcp, mci) = channel(&mut backing);

        mcp.write_close_session(7);
        mci.write_u32(
            MCP_MESSAGE_OFFSET + layout::ID,
            u32::from(McpCmd::Map) | FLAG_RESPONSE,
        );
        assert_eq!(mcp.read_close_session_rsp(), Err(Error::Mci));
    }

    #[test]
    fn recognized_rejections_map_to_kinds() {
        assert_eq!(
            domain_error(MCP_RET_ERR_CONTAINER_LOCKED),
            Error::Mcp(McpError::ContainerLocked)
        );
        assert_eq!(domain_error(0x99), Error::Mcp(McpError::Other(0x99)));
    }

    #[test]
    fn exiting_wins_over_waiting() {
        let mut backing = vec![0u8; MCI_BUFFER_SIZE];
        let (mcp, _) = channel(&mut backing);

        mcp.set_exiting();
        assert_eq!(mcp.wait(Duration::from_secs(5)), McpWait::Exiting);
    }

    #[test]
    fn unsignalled_wait_times_out() {
        let mut backing = vec![0u8; MCI_BUFFER_SIZE];
        let (mcp, _) = channel(&mut backing);

        assert_eq!(mcp.wait(Duration::from_millis(10)), McpWait::TimedOut);
    }
}
