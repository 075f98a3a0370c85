// SPDX-License-Identifier: Apache-2.0

//! Thin capability over the secure-world kernel driver.
//!
//! [`Kmod`] is the seam between the broker and the kernel: the daemon and
//! the client library only ever talk to the driver through this trait, so
//! the whole secure world can be substituted in tests. [`McKmod`] is the
//! real binding over `/dev/mobicore`.
//!
//! Every failing driver call is reported as [`Error::Kmod`] carrying the
//! raw errno.

mod ioctls;

use std::fs::{File, OpenOptions};
use std::io::Read as _;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use mmarinus::{perms, Map, Shared};
use tracing::debug;

use crate::error::{Error, McResult};
use crate::proto::{make_version, version_ok, version_string};
use crate::wsm::Wsm;

use ioctls::{Info, InitBuffers, MapBuffer, RegisterWsmL2, ResolveContiguousWsm, ResolveWsmL2};

/// Required driver interface version.
pub const KMOD_API_VERSION: u32 = make_version(1, 1);

/// Result of registering an L2 page table for a user buffer.
#[derive(Clone, Copy, Debug)]
pub struct L2Registration {
    pub handle: u32,
    pub table_phys: u64,
}

/// Capability set the kernel driver exposes to the broker.
pub trait Kmod: Send + Sync {
    /// Allocate a driver-contiguous shared buffer and map it here.
    fn map_shared(&self, len: u32) -> McResult<Wsm>;

    /// Map the MCI region; `true` means the region survived a previous
    /// daemon instance and the secure world is already initialized.
    fn map_mci(&self, len: u32) -> McResult<(Wsm, bool)>;

    /// Register an L2 page table for a user buffer owned by `pid`.
    fn register_l2(&self, virt: u64, len: u32, pid: u32) -> McResult<L2Registration>;

    fn unregister_l2(&self, handle: u32) -> McResult<()>;

    fn lock_l2(&self, handle: u32) -> McResult<()>;

    fn unlock_l2(&self, handle: u32) -> McResult<()>;

    /// Physical address of the L2 table behind `handle`.
    fn find_l2(&self, handle: u32) -> McResult<u64>;

    /// Physical base and length of a contiguous buffer.
    fn find_contiguous(&self, handle: u32) -> McResult<(u64, u32)>;

    /// Release a contiguous buffer. The user mapping dies with the
    /// [`Wsm`]; this tells the driver to drop its side.
    fn free(&self, wsm: Wsm) -> McResult<()>;

    /// Hand the secure world the queue and MCP offsets inside the MCI.
    fn fc_init(&self, nq_offset: u32, nq_length: u32, mcp_offset: u32, mcp_length: u32)
        -> McResult<()>;

    fn fc_yield(&self) -> McResult<()>;

    fn fc_nsiq(&self) -> McResult<()>;

    /// Secure-world state plus one extended info word.
    fn fc_info(&self, ext_info_id: u32) -> McResult<(u32, u32)>;

    /// Block until the next S-SIQ; returns the interrupt counter.
    fn wait_ssiq(&self) -> McResult<u32>;

    /// Drop orphaned L2 registrations of dead processes.
    fn cleanup_l2(&self) -> McResult<()>;

    /// Driver interface version.
    fn version(&self) -> McResult<u32>;
}

/// The real kernel binding.
pub struct McKmod {
    file: File,
}

/// iocuddle wants a mutable handle; ioctls on one fd are kernel-side
/// serialized, so a throwaway fd view keeps the binding shareable.
struct FdView(RawFd);

impl AsRawFd for FdView {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl McKmod {
    /// Open the driver node and verify the interface version.
    pub fn open(path: impl AsRef<Path>) -> McResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(Error::kmod)?;

        let kmod = Self { file };
        let version = kmod.version()?;
        if !version_ok(KMOD_API_VERSION, version) {
            debug!(
                reported = %version_string(version),
                required = %version_string(KMOD_API_VERSION),
                "kernel module version mismatch"
            );
            return Err(Error::KmodVersion);
        }

        Ok(kmod)
    }

    fn fd(&self) -> FdView {
        FdView(self.file.as_raw_fd())
    }
}

impl Kmod for McKmod {
    fn map_shared(&self, len: u32) -> McResult<Wsm> {
        let mut params = MapBuffer {
            len,
            ..Default::default()
        };
        ioctls::MAP_WSM
            .ioctl(&mut self.fd(), &mut params)
            .map_err(Error::kmod)?;

        let mut file = self.file.try_clone().map_err(Error::kmod)?;
        let map = Map::bytes(len as usize)
            .anywhere()
            .from(&mut file, params.phys_addr as libc::off_t)
            .with_kind(Shared)
            .with(perms::ReadWrite)
            .map_err(|err| Error::kmod(err.err))?;

        Ok(Wsm::with_map(map, params.phys_addr, params.handle, len))
    }

    fn map_mci(&self, len: u32) -> McResult<(Wsm, bool)> {
        let mut params = MapBuffer {
            len,
            ..Default::default()
        };
        ioctls::MAP_MCI
            .ioctl(&mut self.fd(), &mut params)
            .map_err(Error::kmod)?;

        let mut file = self.file.try_clone().map_err(Error::kmod)?;
        let map = Map::bytes(len as usize)
            .anywhere()
            .from(&mut file, 0)
            .with_kind(Shared)
            .with(perms::ReadWrite)
            .map_err(|err| Error::kmod(err.err))?;

        let wsm = Wsm::with_map(map, params.phys_addr, params.handle, len);
        Ok((wsm, params.reused != 0))
    }

    fn register_l2(&self, virt: u64, len: u32, pid: u32) -> McResult<L2Registration> {
        let mut params = RegisterWsmL2 {
            buffer: virt,
            len,
            pid,
            ..Default::default()
        };
        ioctls::REG_WSM
            .ioctl(&mut self.fd(), &mut params)
            .map_err(Error::kmod)?;

        Ok(L2Registration {
            handle: params.handle,
            table_phys: params.table_phys,
        })
    }

    fn unregister_l2(&self, handle: u32) -> McResult<()> {
        ioctls::UNREG_WSM
            .ioctl(&mut self.fd(), handle as _)
            .map_err(Error::kmod)?;
        Ok(())
    }

    fn lock_l2(&self, handle: u32) -> McResult<()> {
        ioctls::LOCK_WSM
            .ioctl(&mut self.fd(), handle as _)
            .map_err(Error::kmod)?;
        Ok(())
    }

    fn unlock_l2(&self, handle: u32) -> McResult<()> {
        ioctls::UNLOCK_WSM
            .ioctl(&mut self.fd(), handle as _)
            .map_err(Error::kmod)?;
        Ok(())
    }

    fn find_l2(&self, handle: u32) -> McResult<u64> {
        let mut params = ResolveWsmL2 {
            handle,
            ..Default::default()
        };
        ioctls::RESOLVE_WSM
            .ioctl(&mut self.fd(), &mut params)
            .map_err(Error::kmod)?;
        Ok(params.phys)
    }

    fn find_contiguous(&self, handle: u32) -> McResult<(u64, u32)> {
        let mut params = ResolveContiguousWsm {
            handle,
            ..Default::default()
        };
        ioctls::RESOLVE_CONT_WSM
            .ioctl(&mut self.fd(), &mut params)
            .map_err(Error::kmod)?;
        Ok((params.phys, params.length))
    }

    fn free(&self, wsm: Wsm) -> McResult<()> {
        let handle = wsm.handle();
        drop(wsm);
        ioctls::FREE
            .ioctl(&mut self.fd(), handle as _)
            .map_err(Error::kmod)?;
        Ok(())
    }

    fn fc_init(
        &self,
        nq_offset: u32,
        nq_length: u32,
        mcp_offset: u32,
        mcp_length: u32,
    ) -> McResult<()> {
        let params = InitBuffers {
            nq_offset,
            nq_length,
            mcp_offset,
            mcp_length,
        };
        ioctls::INIT
            .ioctl(&mut self.fd(), &params)
            .map_err(Error::kmod)?;
        Ok(())
    }

    fn fc_yield(&self) -> McResult<()> {
        ioctls::YIELD.ioctl(&mut self.fd()).map_err(Error::kmod)?;
        Ok(())
    }

    fn fc_nsiq(&self) -> McResult<()> {
        ioctls::NSIQ.ioctl(&mut self.fd()).map_err(Error::kmod)?;
        Ok(())
    }

    fn fc_info(&self, ext_info_id: u32) -> McResult<(u32, u32)> {
        let mut params = Info {
            ext_info_id,
            ..Default::default()
        };
        ioctls::INFO
            .ioctl(&mut self.fd(), &mut params)
            .map_err(Error::kmod)?;
        Ok((params.state, params.ext_info))
    }

    fn wait_ssiq(&self) -> McResult<u32> {
        let mut counter = [0u8; 4];
        (&self.file)
            .read_exact(&mut counter)
            .map_err(Error::kmod)?;
        Ok(u32::from_ne_bytes(counter))
    }

    fn cleanup_l2(&self) -> McResult<()> {
        ioctls::CLEAN_WSM
            .ioctl(&mut self.fd())
            .map_err(Error::kmod)?;
        Ok(())
    }

    fn version(&self) -> McResult<u32> {
        let (_, version) = ioctls::VERSION.ioctl(&self.fd()).map_err(Error::kmod)?;
        Ok(version)
    }
}
