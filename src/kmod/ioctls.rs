// SPDX-License-Identifier: Apache-2.0

//! ioctl definitions for the secure-world kernel driver, built with the
//! iocuddle crate.
//!
//! The driver exposes two shapes of call: struct-carrying requests
//! (modern interface) and bare triggers or handle arguments (classic
//! interface, request number `'M' << 8 | nr`).

#![allow(dead_code)]

use std::os::raw::{c_int, c_ulong, c_void};

use iocuddle::{Group, Ioctl, Read, Write, WriteRead};

const MC: Group = Group::new(b'M');

const fn classic(nr: u8) -> c_ulong {
    (b'M' as c_ulong) << 8 | nr as c_ulong
}

/// Hand the secure world the NQ and MCP offsets inside the MCI region.
pub const INIT: Ioctl<Write, &InitBuffers> = unsafe { MC.write(0x00) };

/// Query secure-world state and one extended info word.
pub const INFO: Ioctl<WriteRead, &Info> = unsafe { MC.write_read(0x01) };

/// Donate the rest of the timeslice to the secure world.
pub const YIELD: Ioctl<Write, c_void> = unsafe { Ioctl::classic(classic(0x02)) };

/// Raise an N-SIQ, forcing a secure-world scheduling decision.
pub const NSIQ: Ioctl<Write, c_void> = unsafe { Ioctl::classic(classic(0x03)) };

/// Release a driver-managed contiguous buffer by handle.
pub const FREE: Ioctl<Write, c_int> = unsafe { Ioctl::classic(classic(0x04)) };

/// Register an L2 page table for an arbitrary user buffer.
pub const REG_WSM: Ioctl<WriteRead, &RegisterWsmL2> = unsafe { MC.write_read(0x05) };

/// Drop an L2 registration by handle.
pub const UNREG_WSM: Ioctl<Write, c_int> = unsafe { Ioctl::classic(classic(0x06)) };

/// Pin an L2 registration so the owner cannot release it.
pub const LOCK_WSM: Ioctl<Write, c_int> = unsafe { Ioctl::classic(classic(0x07)) };

/// Undo `LOCK_WSM`.
pub const UNLOCK_WSM: Ioctl<Write, c_int> = unsafe { Ioctl::classic(classic(0x08)) };

/// Allocate a driver-contiguous shared buffer.
pub const MAP_WSM: Ioctl<WriteRead, &MapBuffer> = unsafe { MC.write_read(0x09) };

/// Map (or re-attach to) the MCI region.
pub const MAP_MCI: Ioctl<WriteRead, &MapBuffer> = unsafe { MC.write_read(0x0A) };

/// Resolve an L2 handle to the physical address of its page table.
pub const RESOLVE_WSM: Ioctl<WriteRead, &ResolveWsmL2> = unsafe { MC.write_read(0x0B) };

/// Resolve a contiguous-buffer handle to its physical base and length.
pub const RESOLVE_CONT_WSM: Ioctl<WriteRead, &ResolveContiguousWsm> =
    unsafe { MC.write_read(0x0C) };

/// Drop every orphaned L2 registration of dead processes.
pub const CLEAN_WSM: Ioctl<Write, c_void> = unsafe { Ioctl::classic(classic(0x0D)) };

/// Read the driver interface version.
pub const VERSION: Ioctl<Read, &u32> = unsafe { MC.read(0x0E) };

#[repr(C)]
#[derive(Debug, Default)]
pub struct InitBuffers {
    pub nq_offset: u32,
    pub nq_length: u32,
    pub mcp_offset: u32,
    pub mcp_length: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct Info {
    /// In: extended info id to fetch alongside the state.
    pub ext_info_id: u32,
    /// Out: secure-world state word.
    pub state: u32,
    /// Out: requested extended info word.
    pub ext_info: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct MapBuffer {
    /// In: requested length.
    pub len: u32,
    /// Out: driver handle.
    pub handle: u32,
    /// Out: physical base, which doubles as the mmap offset.
    pub phys_addr: u64,
    /// Out (MCI only): the region survived a previous daemon instance.
    pub reused: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct RegisterWsmL2 {
    /// In: user virtual base of the buffer.
    pub buffer: u64,
    /// In: buffer length.
    pub len: u32,
    /// In: pid of the owning process.
    pub pid: u32,
    /// Out: driver handle.
    pub handle: u32,
    pub reserved: u32,
    /// Out: physical address of the registered L2 table.
    pub table_phys: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct ResolveWsmL2 {
    pub handle: u32,
    pub reserved: u32,
    pub phys: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct ResolveContiguousWsm {
    pub handle: u32,
    pub length: u32,
    pub phys: u64,
}
