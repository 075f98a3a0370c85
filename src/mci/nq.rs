// SPDX-License-Identifier: Apache-2.0

//! Notification queues: two single-producer/single-consumer rings over
//! one shared region, MC→NWd and NWd→MC.
//!
//! A slot becomes visible to the consumer only once the producer
//! publishes the advanced write position with release ordering. Overflow
//! is loss-free by construction: the secure side never outruns the
//! normal-world drain in steady state, so a full queue on `put` is a
//! scheduling bug, not a transient.

use crate::mci::{MciRegion, NOTIFICATION_SIZE, NQ_HEADER_SIZE};
use crate::proto::NotificationRecord;

/// The producer would overwrite an unconsumed slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFull;

/// One ring direction.
#[derive(Clone, Copy, Debug)]
pub struct NotificationQueue {
    mci: MciRegion,
    base: usize,
    capacity: u32,
}

impl NotificationQueue {
    pub fn new(mci: MciRegion, base: usize, capacity: u32) -> Self {
        Self {
            mci,
            base,
            capacity,
        }
    }

    fn write_pos(&self) -> usize {
        self.base
    }

    fn read_pos(&self) -> usize {
        self.base + 4
    }

    fn slot(&self, pos: u32) -> usize {
        self.base + NQ_HEADER_SIZE + (pos % self.capacity) as usize * NOTIFICATION_SIZE
    }

    /// Publish one record.
    pub fn put(&self, record: NotificationRecord) -> Result<(), QueueFull> {
        let read = self.mci.read_u32(self.read_pos());
        let write = self.mci.read_u32(self.write_pos());
        if write.wrapping_sub(read) >= self.capacity {
            return Err(QueueFull);
        }

        let slot = self.slot(write);
        self.mci.write_u32(slot, record.session_id);
        self.mci.write_u32(slot + 4, record.payload as u32);
        self.mci.write_u32(self.write_pos(), write.wrapping_add(1));
        Ok(())
    }

    /// Consume the next record, `None` when empty.
    pub fn get(&self) -> Option<NotificationRecord> {
        let write = self.mci.read_u32(self.write_pos());
        let read = self.mci.read_u32(self.read_pos());
        if read == write {
            return None;
        }

        let slot = self.slot(read);
        let record = NotificationRecord {
            session_id: self.mci.read_u32(slot),
            payload: self.mci.read_u32(slot + 4) as i32,
        };
        self.mci.write_u32(self.read_pos(), read.wrapping_add(1));
        Some(record)
    }
}
