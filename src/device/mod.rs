// SPDX-License-Identifier: Apache-2.0

//! The device core: owns the kernel binding, the MCI region, the MCP
//! channel, the notification queues, the session table and the two
//! worker threads.
//!
//! Propagation policy: validation errors are handled locally with no
//! side effects; MCP domain errors are returned verbatim without
//! touching state; fastcall failures during init are fatal for the
//! device; an S-SIQ failure terminates the IRQ thread and wakes any MCP
//! waiter with [`Error::Notification`].

mod irq;
mod scheduler;
pub mod session;

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, McResult};
use crate::kmod::{Kmod, McKmod};
use crate::mci::mcp::{McpChannel, McpWait};
use crate::mci::nq::NotificationQueue;
use crate::mci::{
    MciRegion, SecureWorldStatus, DIAG_INFO_IDS, EXT_INFO_ID_MCI_VERSION, EXT_INFO_ID_STATE,
    MCI_BUFFER_SIZE, MCI_VERSION, MCP_BUFFER_SIZE, NQ_BUFFER_SIZE, NQ_IN_OFFSET, NQ_NUM_ELEMS,
    NQ_OUT_OFFSET, SID_MCP,
};
use crate::proto::{version_ok, version_string, NotificationRecord, OpenSessionRsp, Uuid,
    VersionInfo};
use crate::server::connection::Connection;
use crate::sync::Semaphore;
use crate::wsm::Wsm;

use session::{BulkBuffer, TrustletSession};

/// Timeslice of the cooperative scheduler, in yields between forced
/// scheduling decisions.
pub const SCHEDULING_FREQ: u32 = 16;

const MCP_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const MCP_WAIT_RETRIES: u32 = 5;

/// One secure device.
pub struct Device {
    device_id: u32,
    kmod: Arc<dyn Kmod>,
    mci: MciRegion,
    /// Keeps the MCI mapping alive for the life of the device.
    _mci_wsm: Wsm,
    /// MC→NWd, drained by the IRQ loop.
    nq_out: NotificationQueue,
    /// NWd→MC, fed by [`Device::notify`] and MCP dispatch.
    nq_in: NotificationQueue,
    mcp: McpChannel,
    /// Serializes MCP transactions; held across request and response.
    mcp_lock: Mutex<()>,
    sessions: Mutex<HashMap<u32, TrustletSession>>,
    /// Notifications that raced the session-table update, keyed by the
    /// session id they arrived for.
    unknown: Mutex<HashMap<u32, VecDeque<NotificationRecord>>>,
    sched_sync: Semaphore,
    scheduler_enabled: bool,
    exiting: AtomicBool,
    /// Latched when the secure world stops answering; fails all further
    /// MCP transactions.
    fault: AtomicBool,
    version_info: Mutex<Option<VersionInfo>>,
    next_device_session: AtomicU32,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Open the kernel driver and bring up the secure world.
    pub fn open(
        device_id: u32,
        driver_path: impl AsRef<Path>,
        enable_scheduler: bool,
    ) -> McResult<Arc<Self>> {
        let kmod = Arc::new(McKmod::open(driver_path)?);
        Self::with_kmod(device_id, kmod, enable_scheduler)
    }

    /// Bring up the secure world over an already-open kernel binding.
    pub fn with_kmod(
        device_id: u32,
        kmod: Arc<dyn Kmod>,
        enable_scheduler: bool,
    ) -> McResult<Arc<Self>> {
        let (mci_wsm, reused) = kmod.map_mci(MCI_BUFFER_SIZE as u32)?;
        let mci = unsafe { MciRegion::new(mci_wsm.virt() as *mut u8, mci_wsm.len() as usize) };

        let (_, mci_version) = kmod.fc_info(EXT_INFO_ID_MCI_VERSION)?;
        if !version_ok(MCI_VERSION, mci_version) {
            error!(
                reported = %version_string(mci_version),
                required = %version_string(MCI_VERSION),
                "secure world implements an incompatible MCI"
            );
            return Err(Error::Mci);
        }

        // Only initialize if the region did not survive a previous
        // daemon instance; a reused MCI means the secure world is
        // already up.
        if !reused {
            mci.zero();
            kmod.fc_init(
                0,
                NQ_BUFFER_SIZE as u32,
                NQ_BUFFER_SIZE as u32,
                MCP_BUFFER_SIZE as u32,
            )?;

            // The first empty N-SIQ makes the secure world set up its
            // side of the MCI.
            kmod.fc_nsiq()?;

            loop {
                let (state, _) = kmod.fc_info(EXT_INFO_ID_STATE)?;
                match SecureWorldStatus::try_from(state) {
                    Ok(SecureWorldStatus::Initialized) => break,
                    Ok(SecureWorldStatus::NotInitialized) => {
                        // Give it CPU time and ask again.
                        kmod.fc_yield()?;
                        thread::sleep(Duration::from_secs(1));
                    }
                    Ok(SecureWorldStatus::Halt) => {
                        dump_diagnostics(kmod.as_ref());
                        error!("secure world halted during initialization");
                        return Err(Error::Mci);
                    }
                    _ => {
                        error!(state, "secure world reported a bad init state");
                        return Err(Error::Mci);
                    }
                }
            }
        } else {
            info!("MCI region reused, secure world already initialized");
        }

        Ok(Arc::new(Self {
            device_id,
            kmod,
            mci,
            _mci_wsm: mci_wsm,
            nq_out: NotificationQueue::new(mci, NQ_OUT_OFFSET, NQ_NUM_ELEMS),
            nq_in: NotificationQueue::new(mci, NQ_IN_OFFSET, NQ_NUM_ELEMS),
            mcp: McpChannel::new(mci),
            mcp_lock: Mutex::new(()),
            sessions: Mutex::new(HashMap::new()),
            unknown: Mutex::new(HashMap::new()),
            sched_sync: Semaphore::new(),
            scheduler_enabled: enable_scheduler,
            exiting: AtomicBool::new(false),
            fault: AtomicBool::new(false),
            version_info: Mutex::new(None),
            next_device_session: AtomicU32::new(1),
            threads: Mutex::new(Vec::new()),
        }))
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Start the IRQ thread and, if enabled, the scheduler thread.
    pub fn start(self: &Arc<Self>) -> McResult<()> {
        let mut threads = self.threads.lock().unwrap();

        let device = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("mcbroker-irq".into())
                .spawn(move || irq::run(&device))
                .map_err(Error::kmod)?,
        );

        if self.scheduler_enabled {
            let device = Arc::clone(self);
            threads.push(
                thread::Builder::new()
                    .name("mcbroker-sched".into())
                    .spawn(move || scheduler::run(&device))
                    .map_err(Error::kmod)?,
            );
        }

        Ok(())
    }

    /// Orderly teardown: the caller must first make `wait_ssiq` fail
    /// (close the driver side) so the IRQ thread can exit.
    pub fn stop(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.mcp.set_exiting();
        self.sched_sync.signal();

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Trigger a secure-world scheduling decision and wake the
    /// scheduler loop.
    fn nsiq(&self) -> McResult<()> {
        self.kmod.fc_nsiq()?;
        self.sched_sync.signal();
        Ok(())
    }

    fn post_notification(&self, session_id: u32) -> McResult<()> {
        let record = NotificationRecord {
            session_id,
            payload: 0,
        };
        if self.nq_in.put(record).is_err() {
            // Never expected under correct scheduling.
            error!(session_id, "NWd→MC notification queue overflow");
            return Err(Error::Mci);
        }
        self.nsiq()
    }

    /// Publish a session notification towards the secure world. No
    /// response; unknown ids are rejected so clients cannot flood the
    /// queue.
    pub fn notify(&self, session_id: u32) -> McResult<()> {
        if session_id != SID_MCP && !self.sessions.lock().unwrap().contains_key(&session_id) {
            debug!(session_id, "notify for unknown session dropped");
            return Err(Error::UnknownSession);
        }
        self.post_notification(session_id)
    }

    /// Run one MCP transaction: write the command, kick the secure
    /// world, wait for the IRQ loop to flag the response, read it back.
    fn mcp_transaction<T>(
        &self,
        write: impl FnOnce(&McpChannel),
        read: impl FnOnce(&McpChannel) -> McResult<T>,
    ) -> McResult<T> {
        let _serialized = self.mcp_lock.lock().unwrap();

        if self.fault.load(Ordering::SeqCst) {
            return Err(Error::Mci);
        }

        write(&self.mcp);
        self.post_notification(SID_MCP)?;
        self.wait_mcp_notification()?;
        read(&self.mcp)
    }

    fn wait_mcp_notification(&self) -> McResult<()> {
        let mut attempts = MCP_WAIT_RETRIES;
        loop {
            match self.mcp.wait(MCP_WAIT_TIMEOUT) {
                McpWait::Signalled => return Ok(()),
                McpWait::Exiting => return Err(Error::Notification),
                McpWait::TimedOut => {
                    if let Ok((state, _)) = self.kmod.fc_info(EXT_INFO_ID_STATE) {
                        if state == SecureWorldStatus::Halt as u32 {
                            dump_diagnostics(self.kmod.as_ref());
                            self.fault.store(true, Ordering::SeqCst);
                            return Err(Error::Mci);
                        }
                    }
                    attempts -= 1;
                    if attempts == 0 {
                        error!("no MCP answer, marking secure world faulted");
                        self.fault.store(true, Ordering::SeqCst);
                        return Err(Error::Mci);
                    }
                    warn!(attempts, "MCP response overdue, retrying wait");
                }
            }
        }
    }

    /// Open a session with the Trustlet `uuid`. `blob` is the
    /// authenticated service blob the registry assembled; it is
    /// registered with the driver for the duration of the transaction.
    pub fn open_session(
        &self,
        device_conn: u64,
        uuid: &Uuid,
        tci_handle: u32,
        tci_len: u32,
        blob: &[u8],
    ) -> McResult<OpenSessionRsp> {
        let (tci_phys, wsm_len) = self
            .kmod
            .find_contiguous(tci_handle)
            .map_err(|_| Error::WsmNotFound)?;
        if tci_len > wsm_len {
            return Err(Error::TciGreaterThanWsm);
        }

        // Pin the TCI for the session lifetime.
        self.kmod
            .lock_l2(tci_handle)
            .map_err(|_| Error::WsmNotFound)?;

        let blob_reg = match self
            .kmod
            .register_l2(blob.as_ptr() as u64, blob.len() as u32, std::process::id())
        {
            Ok(reg) => reg,
            Err(err) => {
                let _ = self.kmod.unlock_l2(tci_handle);
                return Err(err);
            }
        };

        let result = self.mcp_transaction(
            |mcp| {
                mcp.write_open_session(
                    uuid,
                    tci_phys,
                    tci_len,
                    blob_reg.table_phys,
                    (blob.as_ptr() as u64 & 0xFFF) as u32,
                    blob.len() as u32,
                )
            },
            |mcp| mcp.read_open_session_rsp(),
        );

        // The secure world has copied the blob out by response time.
        let _ = self.kmod.unregister_l2(blob_reg.handle);

        let session_id = match result {
            Ok(session_id) => session_id,
            Err(err) => {
                let _ = self.kmod.unlock_l2(tci_handle);
                return Err(err);
            }
        };

        let device_session_id = self.next_device_session.fetch_add(1, Ordering::Relaxed);
        let session_magic = rand::random();
        let mut session = TrustletSession::new(
            session_id,
            device_session_id,
            session_magic,
            device_conn,
            tci_handle,
        );

        // Adopt notifications that raced the table update.
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(records) = self.unknown.lock().unwrap().remove(&session_id) {
            for record in records {
                session.queue_notification(record);
            }
        }
        sessions.insert(session_id, session);

        info!(session_id, %uuid, "session opened");
        Ok(OpenSessionRsp {
            session_id,
            device_session_id,
            session_magic,
        })
    }

    /// Close a session and release everything it pinned.
    pub fn close_session(&self, session_id: u32) -> McResult<()> {
        if !self.sessions.lock().unwrap().contains_key(&session_id) {
            return Err(Error::UnknownSession);
        }

        self.mcp_transaction(
            |mcp| mcp.write_close_session(session_id),
            |mcp| mcp.read_close_session_rsp(),
        )?;

        self.remove_session(session_id);
        info!(session_id, "session closed");
        Ok(())
    }

    fn remove_session(&self, session_id: u32) {
        self.unknown.lock().unwrap().remove(&session_id);
        let session = self.sessions.lock().unwrap().remove(&session_id);
        if let Some(mut session) = session {
            if self.kmod.unlock_l2(session.tci_handle()).is_err() {
                // Failure here is not important.
                debug!(session_id, "TCI unlock failed");
            }
            for buf in session.drain_bulk_bufs() {
                let _ = self.kmod.unregister_l2(buf.handle);
            }
        }
    }

    /// Map a client buffer into the session's secure address space.
    /// Registers the buffer's page table on the caller's behalf.
    pub fn map_bulk(
        &self,
        session_id: u32,
        client_virt: u64,
        len: u32,
        pid: u32,
    ) -> McResult<u32> {
        if client_virt == 0 {
            return Err(Error::NullPointer);
        }
        if len == 0 {
            return Err(Error::InvalidParameter);
        }
        if !self.sessions.lock().unwrap().contains_key(&session_id) {
            return Err(Error::UnknownSession);
        }

        let reg = self.kmod.register_l2(client_virt, len, pid)?;
        let offset = (client_virt & 0xFFF) as u32;

        let secure_virt = match self.mcp_transaction(
            |mcp| mcp.write_map(session_id, reg.table_phys, offset, len),
            |mcp| mcp.read_map_rsp(),
        ) {
            Ok(secure_virt) => secure_virt,
            Err(err) => {
                let _ = self.kmod.unregister_l2(reg.handle);
                return Err(err);
            }
        };

        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&session_id) {
            Some(session) => {
                session.add_bulk_buf(BulkBuffer {
                    client_virt,
                    len,
                    handle: reg.handle,
                    secure_virt,
                });
                Ok(secure_virt)
            }
            None => {
                // The session died while the MCP call was in flight.
                let _ = self.kmod.unregister_l2(reg.handle);
                Err(Error::UnknownSession)
            }
        }
    }

    /// Undo a bulk mapping, identified by the secure virtual address the
    /// map call returned.
    pub fn unmap_bulk(&self, session_id: u32, secure_virt: u32, len: u32) -> McResult<()> {
        let buf = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions.get(&session_id).ok_or(Error::UnknownSession)?;
            session
                .buf_by_secure_virt(secure_virt)
                .ok_or(Error::BulkBufferNotFound)?
        };

        self.mcp_transaction(
            |mcp| mcp.write_unmap(session_id, secure_virt, len),
            |mcp| mcp.read_unmap_rsp(),
        )?;

        if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
            session.remove_bulk_buf(buf.client_virt);
        }
        let _ = self.kmod.unregister_l2(buf.handle);
        Ok(())
    }

    /// Secure-world version report, cached after the first query.
    pub fn mobicore_version(&self) -> McResult<VersionInfo> {
        if let Some(info) = *self.version_info.lock().unwrap() {
            return Ok(info);
        }

        let info = self.mcp_transaction(
            |mcp| mcp.write_get_version(),
            |mcp| mcp.read_get_version_rsp(),
        )?;
        *self.version_info.lock().unwrap() = Some(info);
        Ok(info)
    }

    /// Validate the credential pair handed out by `open_session`. A
    /// mismatch means some other client is trying to subscribe to the
    /// session's notifications.
    pub fn connect_nq(
        &self,
        session_id: u32,
        device_session_id: u32,
        session_magic: u32,
    ) -> McResult<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&session_id).ok_or(Error::UnknownSession)?;
        if !session.credentials_match(device_session_id, session_magic) {
            return Err(Error::UnknownSession);
        }
        Ok(())
    }

    /// Attach the notification channel. Runs after the NqConnect reply
    /// so buffered notifications land behind it on the socket, in
    /// order, before the channel goes live.
    pub fn attach_nq(&self, session_id: u32, conn: Arc<Connection>) -> McResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&session_id).ok_or(Error::UnknownSession)?;
        session.connect_nq(conn)
    }

    /// True while at least one session was opened through `conn_id`.
    pub fn has_sessions_for(&self, conn_id: u64) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .any(|session| session.device_conn() == conn_id)
    }

    /// A device command channel died: close every session it opened
    /// (newest first) and sweep orphaned driver registrations.
    pub fn drop_device_connection(&self, conn_id: u64) {
        let mut owned: Vec<u32> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| session.device_conn() == conn_id)
            .map(|session| session.session_id())
            .collect();
        owned.sort_unstable_by(|a, b| b.cmp(a));

        for session_id in owned {
            if let Err(err) = self.close_session(session_id) {
                warn!(session_id, %err, "session cleanup after connection drop failed");
                self.remove_session(session_id);
            }
        }

        let _ = self.kmod.cleanup_l2();
    }

    /// A notification channel died: detach it from its session.
    pub fn drop_nq_connection(&self, conn_id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            if session.nq_conn_id() == Some(conn_id) {
                session.disconnect_nq();
            }
        }
    }
}

fn dump_diagnostics(kmod: &dyn Kmod) {
    for &(id, name) in DIAG_INFO_IDS {
        match kmod.fc_info(id) {
            Ok((state, info)) => warn!(id, name, state, info = %format!("{info:#010x}")),
            Err(err) => warn!(id, name, %err, "diagnostic word unavailable"),
        }
    }
}
