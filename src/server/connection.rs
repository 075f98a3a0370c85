// SPDX-License-Identifier: Apache-2.0

//! One accepted client connection.
//!
//! All framing is fixed-shape structs; a short read is a dead peer, a
//! shape mismatch is a framing error. Writes go through `&UnixStream`,
//! so the IRQ loop can push notification records without exclusive
//! access.

use std::io::{Read, Write};
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, McResult};

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    id: u64,
}

impl Connection {
    pub fn new(stream: UnixStream, id: u64) -> Self {
        Self { stream, id }
    }

    /// Stable identity for session-ownership bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Read a bare little-endian word, the leading command id.
    pub fn read_u32(&self) -> McResult<u32> {
        let mut buf = [0u8; 4];
        (&self.stream)
            .read_exact(&mut buf)
            .map_err(|_| Error::SocketRead)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read one fixed-shape struct.
    pub fn read_struct<T: FromBytes>(&self) -> McResult<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        (&self.stream)
            .read_exact(&mut buf)
            .map_err(|_| Error::SocketRead)?;
        T::read_from_bytes(&buf).map_err(|_| Error::SocketLength)
    }

    /// Read the remainder of a command whose id has been consumed
    /// already.
    pub fn read_command<T: FromBytes>(&self, cmd_id: u32) -> McResult<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        buf[..4].copy_from_slice(&cmd_id.to_le_bytes());
        (&self.stream)
            .read_exact(&mut buf[4..])
            .map_err(|_| Error::SocketRead)?;
        T::read_from_bytes(&buf).map_err(|_| Error::SocketLength)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> McResult<()> {
        (&self.stream)
            .write_all(bytes)
            .map_err(|_| Error::SocketWrite)
    }

    pub fn write_struct<T: IntoBytes + Immutable>(&self, value: &T) -> McResult<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Pid of the peer process, for registering its buffers with the
    /// driver on its behalf.
    pub fn peer_pid(&self) -> McResult<u32> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::SocketRead);
        }
        Ok(cred.pid as u32)
    }
}
