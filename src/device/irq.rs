// SPDX-License-Identifier: Apache-2.0

//! The IRQ loop: consume S-SIQs, drain the incoming notification queue,
//! dispatch to sessions or the MCP waiter.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::mci::SID_MCP;

use super::Device;

pub(super) fn run(device: &Device) {
    loop {
        match device.kmod.wait_ssiq() {
            Ok(counter) => trace!(counter, "S-SIQ"),
            Err(err) => {
                debug!(%err, "S-SIQ wait failed, IRQ loop exiting");
                break;
            }
        }

        while let Some(record) = device.nq_out.get() {
            if record.session_id == SID_MCP {
                // Wake the in-flight MCP transaction.
                device.mcp.signal();
                continue;
            }

            let mut sessions = device.sessions.lock().unwrap();
            match sessions.get_mut(&record.session_id) {
                Some(session) => {
                    if record.payload != 0 {
                        // Session end point died; keep the exit code.
                        session.set_error_info(record.payload);
                    }
                    session.deliver(record);
                }
                None => {
                    // The secure world raced our session-table update;
                    // hold the notification until the session appears.
                    debug!(
                        session_id = record.session_id,
                        "notification for unknown session buffered"
                    );
                    device
                        .unknown
                        .lock()
                        .unwrap()
                        .entry(record.session_id)
                        .or_default()
                        .push_back(record);
                }
            }
        }

        device.sched_sync.signal();
    }

    // No response will ever arrive; pending MCP callers must fail, the
    // scheduler must get a chance to observe the flag.
    device.exiting.store(true, Ordering::SeqCst);
    device.mcp.set_exiting();
    device.sched_sync.signal();
}
