// SPDX-License-Identifier: Apache-2.0

//! The client library.
//!
//! All process-wide state lives in one [`DaemonContext`], constructed
//! once and passed to every entry point; every call takes its device
//! table lock for the full duration of the work. That is the chosen
//! simplicity/throughput tradeoff: long operations on one device block
//! the process's other clients, and the MCP channel behind the daemon is
//! a singleton resource anyway.
//!
//! Socket failures on a device channel remove the device from the
//! table, so subsequent calls fail with [`Error::UnknownDevice`] until
//! the device is opened again.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::mem::size_of;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tracing::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, McResult};
use crate::kmod::{Kmod, McKmod};
use crate::proto::{
    CloseDeviceCmd, CloseSessionCmd, Command, GetMobicoreVersionCmd, GetVersionCmd, GetVersionRsp,
    MapBulkCmd, MapBulkRsp, NotificationRecord, NotifyCmd, NqConnectCmd, OpenDeviceCmd,
    OpenSessionCmd, OpenSessionRsp, ResponseHeader, UnmapBulkCmd, Uuid, VersionInfo,
    DAEMON_VERSION, MAX_TCI_LEN,
};
use crate::wsm::WsmRegistry;
use crate::{DEFAULT_DEVICE_NODE, DEFAULT_SOCKET};

static SIGPIPE_ONCE: Once = Once::new();

/// A daemon crash must surface as a socket write error, not kill the
/// client process.
fn ignore_sigpipe() {
    SIGPIPE_ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// How to reach the daemon and the driver.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Abstract socket name of the daemon.
    pub socket: String,
    /// Kernel driver node for shared-buffer allocation.
    pub device_node: PathBuf,
    /// Restore the historical result-code rewrites on map and
    /// close-session failures.
    pub legacy_error_codes: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket: DEFAULT_SOCKET.to_owned(),
            device_node: PathBuf::from(DEFAULT_DEVICE_NODE),
            legacy_error_codes: false,
        }
    }
}

/// Names one open session towards an open device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub device_id: u32,
    pub session_id: u32,
}

/// What a successful `map` hands back: where the Trustlet sees the
/// buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkMapInfo {
    pub secure_virt: u32,
    pub len: u32,
}

struct ClientSession {
    notification: UnixStream,
    /// client virtual base → (len, secure virtual address)
    bulk: HashMap<u64, (u32, u32)>,
    last_err: i32,
}

struct ClientDevice {
    conn: UnixStream,
    kmod: Arc<dyn Kmod>,
    wsm: WsmRegistry,
    sessions: HashMap<u32, ClientSession>,
}

/// Process-wide client context.
pub struct DaemonContext {
    cfg: ClientConfig,
    kmod_override: Option<Arc<dyn Kmod>>,
    devices: Mutex<HashMap<u32, ClientDevice>>,
}

impl DaemonContext {
    pub fn new(cfg: ClientConfig) -> Self {
        Self {
            cfg,
            kmod_override: None,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Use an already-open kernel binding for every device instead of
    /// opening the driver node. This is the seam tests hang a fake
    /// secure world on.
    pub fn with_kmod(cfg: ClientConfig, kmod: Arc<dyn Kmod>) -> Self {
        Self {
            cfg,
            kmod_override: Some(kmod),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the daemon, check its version, and open `device_id`.
    pub fn open_device(&self, device_id: u32) -> McResult<()> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&device_id) {
            return Err(Error::DeviceAlreadyOpen);
        }

        ignore_sigpipe();

        let conn = connect(&self.cfg.socket)?;

        // Runtime check of the daemon version before anything else.
        send(
            &conn,
            &GetVersionCmd {
                cmd_id: Command::GetVersion.into(),
            },
        )?;
        recv_header(&conn)?;
        let rsp: GetVersionRsp = recv_payload(&conn)?;
        if !crate::proto::version_ok(DAEMON_VERSION, rsp.version) {
            debug!(reported = rsp.version, "daemon version mismatch");
            return Err(Error::DaemonVersion);
        }

        send(
            &conn,
            &OpenDeviceCmd {
                cmd_id: Command::OpenDevice.into(),
                device_id,
            },
        )?;
        recv_header(&conn)?;

        let kmod = match &self.kmod_override {
            Some(kmod) => Arc::clone(kmod),
            None => Arc::new(McKmod::open(&self.cfg.device_node)?),
        };

        devices.insert(
            device_id,
            ClientDevice {
                conn,
                kmod,
                wsm: WsmRegistry::new(),
                sessions: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Close `device_id`; refused while sessions are open.
    pub fn close_device(&self, device_id: u32) -> McResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get(&device_id).ok_or(Error::UnknownDevice)?;

        if !device.sessions.is_empty() {
            return Err(Error::SessionPending);
        }

        let result = send(
            &device.conn,
            &CloseDeviceCmd {
                cmd_id: Command::CloseDevice.into(),
            },
        )
        .and_then(|()| recv_header(&device.conn));

        match result {
            Ok(()) => {
                drop_device(&mut devices, device_id);
                Ok(())
            }
            Err(err) => Err(fail_device(&mut devices, device_id, err)),
        }
    }

    /// Allocate a driver-contiguous world-shareable buffer.
    pub fn malloc_wsm(&self, device_id: u32, len: u32) -> McResult<*mut u8> {
        if len == 0 {
            return Err(Error::InvalidParameter);
        }

        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or(Error::UnknownDevice)?;

        let wsm = device.kmod.map_shared(len)?;
        let virt = wsm.virt();
        device.wsm.insert(wsm);
        Ok(virt as *mut u8)
    }

    /// Release a buffer obtained from [`Self::malloc_wsm`].
    pub fn free_wsm(&self, device_id: u32, wsm: *mut u8) -> McResult<()> {
        if wsm.is_null() {
            return Err(Error::NullPointer);
        }

        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or(Error::UnknownDevice)?;

        let wsm = device.wsm.remove(wsm as u64)?;
        device.kmod.free(wsm)
    }

    /// Open a session with Trustlet `uuid`, using `tci` (a
    /// `malloc_wsm` buffer) as the command interface.
    pub fn open_session(
        &self,
        device_id: u32,
        uuid: &Uuid,
        tci: *mut u8,
        tci_len: u32,
    ) -> McResult<SessionHandle> {
        if tci.is_null() {
            return Err(Error::NullPointer);
        }
        if tci_len > MAX_TCI_LEN {
            return Err(Error::TciTooBig);
        }

        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or(Error::UnknownDevice)?;

        let wsm = device.wsm.find_by_virt(tci as u64)?;
        if tci_len > wsm.len() {
            return Err(Error::TciGreaterThanWsm);
        }

        send(
            &device.conn,
            &OpenSessionCmd {
                cmd_id: Command::OpenSession.into(),
                device_id,
                uuid: *uuid,
                tci_handle: wsm.handle(),
                tci_len,
            },
        )?;
        recv_header(&device.conn)?;
        let rsp: OpenSessionRsp = recv_payload(&device.conn)?;

        // Second channel for notifications, attached atomically to the
        // session we just opened.
        let notification = connect(&self.cfg.socket)?;
        send(
            &notification,
            &NqConnectCmd {
                cmd_id: Command::NqConnect.into(),
                device_id,
                session_id: rsp.session_id,
                device_session_id: rsp.device_session_id,
                session_magic: rsp.session_magic,
            },
        )?;
        recv_header(&notification)?;

        device.sessions.insert(
            rsp.session_id,
            ClientSession {
                notification,
                bulk: HashMap::new(),
                last_err: 0,
            },
        );

        Ok(SessionHandle {
            device_id,
            session_id: rsp.session_id,
        })
    }

    /// Close a session.
    pub fn close_session(&self, handle: &SessionHandle) -> McResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&handle.device_id)
            .ok_or(Error::UnknownDevice)?;
        if !device.sessions.contains_key(&handle.session_id) {
            return Err(Error::UnknownSession);
        }

        let result = send(
            &device.conn,
            &CloseSessionCmd {
                cmd_id: Command::CloseSession.into(),
                session_id: handle.session_id,
            },
        )
        .and_then(|()| recv_header(&device.conn));

        match result {
            Ok(()) => {
                device.sessions.remove(&handle.session_id);
                Ok(())
            }
            Err(err @ (Error::SocketWrite | Error::SocketRead)) => {
                Err(fail_device(&mut devices, handle.device_id, err))
            }
            Err(err) if self.cfg.legacy_error_codes => {
                debug!(%err, "close-session failure rewritten for legacy callers");
                Err(Error::UnknownDevice)
            }
            Err(err) => Err(err),
        }
    }

    /// Tell the Trustlet its TCI has new input. Never blocks beyond the
    /// socket write; the Trustlet may not observe it until the scheduler
    /// next yields to the secure world.
    pub fn notify(&self, handle: &SessionHandle) -> McResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&handle.device_id)
            .ok_or(Error::UnknownDevice)?;
        if !device.sessions.contains_key(&handle.session_id) {
            return Err(Error::UnknownSession);
        }

        match send(
            &device.conn,
            &NotifyCmd {
                cmd_id: Command::Notify.into(),
                session_id: handle.session_id,
            },
        ) {
            Ok(()) => Ok(()),
            Err(err) => Err(fail_device(&mut devices, handle.device_id, err)),
        }
    }

    /// Block up to `timeout_ms` for the first notification, then drain
    /// whatever else queued up. `-1` blocks indefinitely; `0` only
    /// drains.
    pub fn wait_notification(&self, handle: &SessionHandle, timeout_ms: i32) -> McResult<()> {
        let mut devices = self.devices.lock().unwrap();

        let mut first = true;
        loop {
            let outcome = {
                let device = devices
                    .get_mut(&handle.device_id)
                    .ok_or(Error::UnknownDevice)?;
                let session = device
                    .sessions
                    .get_mut(&handle.session_id)
                    .ok_or(Error::UnknownSession)?;

                let mode = match (first, timeout_ms) {
                    (false, _) | (true, 0) => ReadMode::Drain,
                    (true, ms) if ms < 0 => ReadMode::Infinite,
                    (true, ms) => ReadMode::Millis(ms as u64),
                };

                match read_record(&session.notification, mode) {
                    RecordRead::Record(record) => {
                        if record.payload != 0 {
                            // Session end point died; keep the exit code.
                            session.last_err = record.payload;
                            return Err(Error::InfoNotification);
                        }
                        RecordRead::Record(record)
                    }
                    other => other,
                }
            };

            match outcome {
                RecordRead::Record(_) => first = false,
                RecordRead::Timeout => {
                    return if first { Err(Error::Timeout) } else { Ok(()) };
                }
                RecordRead::Closed => {
                    return if first {
                        warn!(session_id = handle.session_id, "notification channel lost");
                        drop_device(&mut devices, handle.device_id);
                        Err(Error::Notification)
                    } else {
                        Ok(())
                    };
                }
                RecordRead::Broken => {
                    return if first { Err(Error::Notification) } else { Ok(()) };
                }
            }
        }
    }

    /// Map a client buffer into the session's secure address space.
    pub fn map(&self, handle: &SessionHandle, buf: *mut u8, len: u32) -> McResult<BulkMapInfo> {
        if buf.is_null() {
            return Err(Error::NullPointer);
        }

        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&handle.device_id)
            .ok_or(Error::UnknownDevice)?;
        if !device.sessions.contains_key(&handle.session_id) {
            return Err(Error::UnknownSession);
        }

        let result = send(
            &device.conn,
            &MapBulkCmd {
                cmd_id: Command::MapBulkBuf.into(),
                session_id: handle.session_id,
                client_virt: buf as u64,
                len,
                reserved: 0,
            },
        )
        .and_then(|()| recv_header(&device.conn))
        .and_then(|()| recv_payload::<MapBulkRsp>(&device.conn));

        match result {
            Ok(rsp) => {
                let session = device
                    .sessions
                    .get_mut(&handle.session_id)
                    .ok_or(Error::UnknownSession)?;
                session.bulk.insert(buf as u64, (len, rsp.secure_virt));
                Ok(BulkMapInfo {
                    secure_virt: rsp.secure_virt,
                    len,
                })
            }
            Err(err @ (Error::SocketWrite | Error::SocketRead)) => {
                Err(fail_device(&mut devices, handle.device_id, err))
            }
            Err(err) if self.cfg.legacy_error_codes => {
                debug!(%err, "map failure rewritten for legacy callers");
                Err(Error::DaemonUnreachable)
            }
            Err(err) => Err(err),
        }
    }

    /// Undo a [`Self::map`].
    pub fn unmap(
        &self,
        handle: &SessionHandle,
        buf: *mut u8,
        info: &BulkMapInfo,
    ) -> McResult<()> {
        if buf.is_null() {
            return Err(Error::NullPointer);
        }

        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&handle.device_id)
            .ok_or(Error::UnknownDevice)?;
        let session = device
            .sessions
            .get_mut(&handle.session_id)
            .ok_or(Error::UnknownSession)?;

        let &(len, secure_virt) = session
            .bulk
            .get(&(buf as u64))
            .ok_or(Error::BulkBufferNotFound)?;
        if info.secure_virt != secure_virt {
            return Err(Error::InvalidParameter);
        }

        let result = send(
            &device.conn,
            &UnmapBulkCmd {
                cmd_id: Command::UnmapBulkBuf.into(),
                session_id: handle.session_id,
                secure_virt,
                len,
            },
        )
        .and_then(|()| recv_header(&device.conn));

        match result {
            Ok(()) => {
                session.bulk.remove(&(buf as u64));
                Ok(())
            }
            Err(err @ (Error::SocketWrite | Error::SocketRead)) => {
                Err(fail_device(&mut devices, handle.device_id, err))
            }
            Err(err) if self.cfg.legacy_error_codes => {
                debug!(%err, "unmap failure rewritten for legacy callers");
                Err(Error::DaemonUnreachable)
            }
            Err(err) => Err(err),
        }
    }

    /// Exit code of the last terminal notification on this session.
    pub fn session_error_code(&self, handle: &SessionHandle) -> McResult<i32> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(&handle.device_id).ok_or(Error::UnknownDevice)?;
        let session = device
            .sessions
            .get(&handle.session_id)
            .ok_or(Error::UnknownSession)?;
        Ok(session.last_err)
    }

    /// Secure-world version report.
    pub fn mobicore_version(&self, device_id: u32) -> McResult<VersionInfo> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get(&device_id).ok_or(Error::UnknownDevice)?;

        let result = send(
            &device.conn,
            &GetMobicoreVersionCmd {
                cmd_id: Command::GetMobicoreVersion.into(),
            },
        )
        .and_then(|()| recv_header(&device.conn))
        .and_then(|()| recv_payload::<VersionInfo>(&device.conn));

        match result {
            Ok(info) => Ok(info),
            Err(err @ (Error::SocketWrite | Error::SocketRead)) => {
                Err(fail_device(&mut devices, device_id, err))
            }
            Err(err) => Err(err),
        }
    }
}

/// Remove a device and release its shared buffers.
fn drop_device(devices: &mut HashMap<u32, ClientDevice>, device_id: u32) {
    if let Some(mut device) = devices.remove(&device_id) {
        let buffers: Vec<_> = device.wsm.drain().collect();
        for wsm in buffers {
            let _ = device.kmod.free(wsm);
        }
    }
}

/// The connection is dead; the device goes with it.
fn fail_device(devices: &mut HashMap<u32, ClientDevice>, device_id: u32, err: Error) -> Error {
    match err {
        Error::SocketWrite | Error::SocketRead => {
            warn!(device_id, %err, "device channel failed, removing device");
            drop_device(devices, device_id);
            err
        }
        other => other,
    }
}

fn connect(socket: &str) -> McResult<UnixStream> {
    let addr =
        SocketAddr::from_abstract_name(socket.as_bytes()).map_err(|_| Error::SocketConnect)?;
    UnixStream::connect_addr(&addr).map_err(|_| Error::SocketConnect)
}

fn send<T: IntoBytes + Immutable>(stream: &UnixStream, msg: &T) -> McResult<()> {
    let mut writer = stream;
    writer.write_all(msg.as_bytes()).map_err(|_| Error::SocketWrite)
}

fn recv_header(stream: &UnixStream) -> McResult<()> {
    let mut buf = [0u8; size_of::<ResponseHeader>()];
    let mut reader = stream;
    reader.read_exact(&mut buf).map_err(|_| Error::SocketRead)?;
    match Error::from_code(u32::from_le_bytes(buf)) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

fn recv_payload<T: FromBytes>(stream: &UnixStream) -> McResult<T> {
    let mut buf = vec![0u8; size_of::<T>()];
    let mut reader = stream;
    reader.read_exact(&mut buf).map_err(|err| match err.kind() {
        // A truncated response is a framing error, not a dead socket.
        ErrorKind::UnexpectedEof => Error::SocketLength,
        _ => Error::SocketRead,
    })?;
    T::read_from_bytes(&buf).map_err(|_| Error::SocketLength)
}

enum ReadMode {
    Infinite,
    Millis(u64),
    Drain,
}

enum RecordRead {
    Record(NotificationRecord),
    Timeout,
    Closed,
    Broken,
}

fn read_record(stream: &UnixStream, mode: ReadMode) -> RecordRead {
    match mode {
        ReadMode::Infinite => {
            let _ = stream.set_read_timeout(None);
        }
        ReadMode::Millis(ms) => {
            let _ = stream.set_read_timeout(Some(Duration::from_millis(ms)));
        }
        ReadMode::Drain => {
            let _ = stream.set_nonblocking(true);
        }
    }

    let mut buf = [0u8; size_of::<NotificationRecord>()];
    let result = {
        let mut reader = stream;
        reader.read_exact(&mut buf)
    };

    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(None);

    match result {
        Ok(()) => RecordRead::Record(NotificationRecord {
            session_id: u32::from_le_bytes(buf[..4].try_into().unwrap_or_default()),
            payload: i32::from_le_bytes(buf[4..8].try_into().unwrap_or_default()),
        }),
        Err(err) => match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => RecordRead::Timeout,
            ErrorKind::UnexpectedEof => RecordRead::Closed,
            _ => RecordRead::Broken,
        },
    }
}
