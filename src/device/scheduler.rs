// SPDX-License-Identifier: Apache-2.0

//! The cooperative scheduler loop.
//!
//! `yield` returns quickly while the secure world still has work on this
//! core; an N-SIQ forces a scheduling decision; an idle flag means the
//! secure world reported nothing to do and we wait for an interrupt.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::mci::{FLAGS_OFFSET, SCHEDULE_IDLE};

use super::{Device, SCHEDULING_FREQ};

pub(super) fn run(device: &Device) {
    let mut timeslice = SCHEDULING_FREQ;

    loop {
        if device.exiting.load(Ordering::SeqCst) {
            break;
        }

        if device.mci.read_u32(FLAGS_OFFSET) == SCHEDULE_IDLE {
            device.sched_sync.wait();
        } else if timeslice == 0 {
            timeslice = SCHEDULING_FREQ;
            if device.nsiq().is_err() {
                debug!("N-SIQ failed, scheduler exiting");
                break;
            }
        } else {
            timeslice -= 1;
            if device.kmod.fc_yield().is_err() {
                debug!("yield failed, scheduler exiting");
                break;
            }
        }
    }
}
