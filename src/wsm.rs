// SPDX-License-Identifier: Apache-2.0

//! World-shared memory bookkeeping.
//!
//! A [`Wsm`] describes one buffer visible to both worlds: its user-space
//! virtual base, its physical base, the kernel handle and its length.
//! While a `Wsm` is registered, neither the user mapping nor the handle
//! may be reused; each is owned by exactly one holder (the device for the
//! MCI region, a session for a TCI).

use std::collections::HashMap;

use mmarinus::{perms, Map, Shared};

use crate::error::{Error, McResult};

/// One shared buffer. Dropping a `Wsm` unmaps the user mapping (if this
/// process owns one); releasing the kernel handle stays explicit via the
/// kernel binding.
#[derive(Debug)]
pub struct Wsm {
    virt: u64,
    phys: u64,
    handle: u32,
    len: u32,
    map: Option<Map<perms::ReadWrite, Shared>>,
}

impl Wsm {
    /// Describe a buffer whose mapping is owned elsewhere.
    pub fn new(virt: u64, phys: u64, handle: u32, len: u32) -> Self {
        Self {
            virt,
            phys,
            handle,
            len,
            map: None,
        }
    }

    /// Take ownership of a live mapping.
    pub fn with_map(map: Map<perms::ReadWrite, Shared>, phys: u64, handle: u32, len: u32) -> Self {
        Self {
            virt: map.addr() as u64,
            phys,
            handle,
            len,
            map: Some(map),
        }
    }

    pub fn virt(&self) -> u64 {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-device table of registered shared buffers, keyed by the user
/// virtual base. Lookup by pointer and lookup by handle name the same
/// buffer.
#[derive(Debug, Default)]
pub struct WsmRegistry {
    buffers: HashMap<u64, Wsm>,
}

impl WsmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, wsm: Wsm) {
        self.buffers.insert(wsm.virt(), wsm);
    }

    pub fn find_by_virt(&self, virt: u64) -> McResult<&Wsm> {
        self.buffers.get(&virt).ok_or(Error::WsmNotFound)
    }

    pub fn find_by_handle(&self, handle: u32) -> McResult<&Wsm> {
        self.buffers
            .values()
            .find(|wsm| wsm.handle() == handle)
            .ok_or(Error::WsmNotFound)
    }

    pub fn remove(&mut self, virt: u64) -> McResult<Wsm> {
        self.buffers.remove(&virt).ok_or(Error::WsmNotFound)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drain every buffer, handing each to the caller for driver-side
    /// release.
    pub fn drain(&mut self) -> impl Iterator<Item = Wsm> + '_ {
        self.buffers.drain().map(|(_, wsm)| wsm)
    }
}
