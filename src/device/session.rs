// SPDX-License-Identifier: Apache-2.0

//! Per-session state held by the device.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::error::McResult;
use crate::proto::NotificationRecord;
use crate::server::connection::Connection;

/// A client buffer registered with the driver for secure-world access.
///
/// `secure_virt` is assigned by the secure world at map time and is the
/// identity of the mapping at unmap time.
#[derive(Clone, Copy, Debug)]
pub struct BulkBuffer {
    pub client_virt: u64,
    pub len: u32,
    pub handle: u32,
    pub secure_virt: u32,
}

/// One open Trustlet session.
///
/// Owns the session's notification channel once the client's NqConnect
/// lands, the set of mapped bulk buffers keyed by client virtual base,
/// and the last terminal exit code.
#[derive(Debug)]
pub struct TrustletSession {
    session_id: u32,
    device_session_id: u32,
    session_magic: u32,
    device_conn: u64,
    tci_handle: u32,
    notification_conn: Option<Arc<Connection>>,
    pending: VecDeque<NotificationRecord>,
    bulk_bufs: HashMap<u64, BulkBuffer>,
    last_err: i32,
}

impl TrustletSession {
    pub fn new(
        session_id: u32,
        device_session_id: u32,
        session_magic: u32,
        device_conn: u64,
        tci_handle: u32,
    ) -> Self {
        Self {
            session_id,
            device_session_id,
            session_magic,
            device_conn,
            tci_handle,
            notification_conn: None,
            pending: VecDeque::new(),
            bulk_bufs: HashMap::new(),
            last_err: 0,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Id of the device command connection that opened this session.
    pub fn device_conn(&self) -> u64 {
        self.device_conn
    }

    pub fn tci_handle(&self) -> u32 {
        self.tci_handle
    }

    /// Check the credential pair a client presents on NqConnect.
    pub fn credentials_match(&self, device_session_id: u32, session_magic: u32) -> bool {
        self.device_session_id == device_session_id && self.session_magic == session_magic
    }

    pub fn add_bulk_buf(&mut self, buf: BulkBuffer) {
        self.bulk_bufs.insert(buf.client_virt, buf);
    }

    pub fn buf_by_secure_virt(&self, secure_virt: u32) -> Option<BulkBuffer> {
        self.bulk_bufs
            .values()
            .find(|buf| buf.secure_virt == secure_virt)
            .copied()
    }

    pub fn remove_bulk_buf(&mut self, client_virt: u64) -> Option<BulkBuffer> {
        self.bulk_bufs.remove(&client_virt)
    }

    pub fn drain_bulk_bufs(&mut self) -> Vec<BulkBuffer> {
        self.bulk_bufs.drain().map(|(_, buf)| buf).collect()
    }

    pub fn set_error_info(&mut self, code: i32) {
        self.last_err = code;
    }

    pub fn last_err(&self) -> i32 {
        self.last_err
    }

    /// Forward a notification to the client, or hold it until the
    /// notification channel is attached.
    pub fn deliver(&mut self, record: NotificationRecord) {
        match &self.notification_conn {
            Some(conn) => {
                if conn.write_struct(&record).is_err() {
                    debug!(
                        session = self.session_id,
                        "notification write failed, peer presumed dead"
                    );
                }
            }
            None => self.pending.push_back(record),
        }
    }

    pub fn queue_notification(&mut self, record: NotificationRecord) {
        self.pending.push_back(record);
    }

    /// Attach the notification channel, first flushing everything that
    /// queued up before the client connected.
    pub fn connect_nq(&mut self, conn: Arc<Connection>) -> McResult<()> {
        while let Some(record) = self.pending.pop_front() {
            conn.write_struct(&record)?;
        }
        self.notification_conn = Some(conn);
        Ok(())
    }

    /// Detach a dead notification channel.
    pub fn disconnect_nq(&mut self) {
        self.notification_conn = None;
    }

    pub fn nq_conn_id(&self) -> Option<u64> {
        self.notification_conn.as_ref().map(|conn| conn.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn session() -> TrustletSession {
        TrustletSession::new(5, 100, 0xC0FFEE, 1, 77)
    }

    #[test]
    fn bulk_buffers_are_found_by_secure_virt() {
        let mut ts = session();
        ts.add_bulk_buf(BulkBuffer {
            client_virt: 0x4000,
            len: 4096,
            handle: 3,
            secure_virt: 0x1_0000,
        });

        assert_eq!(ts.buf_by_secure_virt(0x1_0000).unwrap().handle, 3);
        assert!(ts.buf_by_secure_virt(0x2_0000).is_none());

        assert!(ts.remove_bulk_buf(0x4000).is_some());
        assert!(ts.buf_by_secure_virt(0x1_0000).is_none());
    }

    #[test]
    fn credentials_require_both_halves() {
        let ts = session();
        assert!(ts.credentials_match(100, 0xC0FFEE));
        assert!(!ts.credentials_match(100, 0xBAD));
        assert!(!ts.credentials_match(99, 0xC0FFEE));
    }

    #[test]
    fn queued_notifications_flush_in_order_on_connect() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut ts = session();

        ts.deliver(NotificationRecord {
            session_id: 5,
            payload: 0,
        });
        ts.queue_notification(NotificationRecord {
            session_id: 5,
            payload: 7,
        });

        ts.connect_nq(Arc::new(Connection::new(ours, 9))).unwrap();
        ts.deliver(NotificationRecord {
            session_id: 5,
            payload: 0,
        });

        let theirs = Connection::new(theirs, 10);
        let first: NotificationRecord = theirs.read_struct().unwrap();
        let second: NotificationRecord = theirs.read_struct().unwrap();
        let third: NotificationRecord = theirs.read_struct().unwrap();
        assert_eq!(first.payload, 0);
        assert_eq!(second.payload, 7);
        assert_eq!(third.payload, 0);
    }

    #[test]
    fn terminal_payload_is_remembered() {
        let mut ts = session();
        assert_eq!(ts.last_err(), 0);
        ts.set_error_info(0xDEAD);
        assert_eq!(ts.last_err(), 0xDEAD);
    }
}
