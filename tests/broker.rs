// SPDX-License-Identifier: Apache-2.0

//! End-to-end broker tests against a fake kernel binding.
//!
//! The fake implements the whole secure world behind the `Kmod` trait:
//! an in-memory MCI region, inline MCP command processing on N-SIQ, and
//! a condition-variable S-SIQ. Real daemon threads, a real abstract
//! UNIX socket, and the real client library run on top of it.

use std::io::{Read, Write};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use zerocopy::IntoBytes;

use mcbroker::client::{ClientConfig, DaemonContext, SessionHandle};
use mcbroker::device::Device;
use mcbroker::error::{Error, McpError};
use mcbroker::mci::mcp::MCP_RET_ERR_CONTAINER_LOCKED;
use mcbroker::proto::{
    Command, GetVersionCmd, NqConnectCmd, Uuid, DAEMON_VERSION, MAX_TCI_LEN,
};
use mcbroker::registry::{
    Registry, MCLF_MAGIC, SO_MAGIC, SO_PARENT_OFFSET, SO_ROOT_CONT_SIZE, SO_SP_CONT_SIZE,
    SO_TLT_CONT_SIZE,
};
use mcbroker::server::handler::ConnectionHandler;
use mcbroker::server::{Broker, Server};

use fake::FakeKmod;

mod fake {
    //! The fake driver plus secure world.

    use std::cell::UnsafeCell;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Condvar, Mutex};

    use zerocopy::IntoBytes;

    use mcbroker::error::{Errno, Error, McResult};
    use mcbroker::kmod::{Kmod, L2Registration, KMOD_API_VERSION};
    use mcbroker::mci::mcp::{layout, McpCmd, FLAG_RESPONSE, MCP_RET_OK};
    use mcbroker::mci::nq::NotificationQueue;
    use mcbroker::mci::{
        MciRegion, SecureWorldStatus, EXT_INFO_ID_MCI_VERSION, MCI_BUFFER_SIZE, MCI_VERSION,
        MCP_MESSAGE_OFFSET, NQ_IN_OFFSET, NQ_NUM_ELEMS, NQ_OUT_OFFSET, SID_MCP,
    };
    use mcbroker::proto::{make_version, NotificationRecord, VersionInfo};
    use mcbroker::wsm::Wsm;

    struct SharedBuf {
        _mem: Box<[u8]>,
        virt: u64,
        phys: u64,
        len: u32,
    }

    struct State {
        mci_mapped: bool,
        next_handle: u32,
        shared: HashMap<u32, SharedBuf>,
        l2: HashMap<u32, u64>,
        locked: HashSet<u32>,
        sessions: HashSet<u32>,
        next_session: u32,
        next_secure_virt: u32,
        fail_next_open: Option<u32>,
        next_notify_payload: i32,
        version_queries: u32,
    }

    #[derive(Default)]
    struct Ssiq {
        counter: u32,
        pending: u32,
        shutdown: bool,
    }

    pub struct FakeKmod {
        mci_mem: Box<UnsafeCell<[u8; MCI_BUFFER_SIZE]>>,
        state: Mutex<State>,
        ssiq: Mutex<Ssiq>,
        ssiq_cv: Condvar,
    }

    // The MCI cell is only ever accessed through the same fenced word
    // protocol both worlds use on real hardware.
    unsafe impl Send for FakeKmod {}
    unsafe impl Sync for FakeKmod {}

    impl FakeKmod {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                mci_mem: Box::new(UnsafeCell::new([0; MCI_BUFFER_SIZE])),
                state: Mutex::new(State {
                    mci_mapped: false,
                    next_handle: 1,
                    shared: HashMap::new(),
                    l2: HashMap::new(),
                    locked: HashSet::new(),
                    sessions: HashSet::new(),
                    next_session: 1,
                    next_secure_virt: 0x0010_0000,
                    fail_next_open: None,
                    next_notify_payload: 0,
                    version_queries: 0,
                }),
                ssiq: Mutex::new(Ssiq::default()),
                ssiq_cv: Condvar::new(),
            })
        }

        fn mci(&self) -> MciRegion {
            unsafe { MciRegion::new(self.mci_mem.get() as *mut u8, MCI_BUFFER_SIZE) }
        }

        fn raise_ssiq(&self) {
            let mut ssiq = self.ssiq.lock().unwrap();
            ssiq.pending += 1;
            self.ssiq_cv.notify_all();
        }

        /// Stop answering; `wait_ssiq` fails and the IRQ loop exits.
        pub fn shutdown(&self) {
            let mut ssiq = self.ssiq.lock().unwrap();
            ssiq.shutdown = true;
            self.ssiq_cv.notify_all();
        }

        /// Emit a notification as if the secure world produced it
        /// spontaneously.
        pub fn inject_notification(&self, session_id: u32, payload: i32) {
            let nq_out = NotificationQueue::new(self.mci(), NQ_OUT_OFFSET, NQ_NUM_ELEMS);
            nq_out
                .put(NotificationRecord {
                    session_id,
                    payload,
                })
                .unwrap();
            self.raise_ssiq();
        }

        /// Make the next OpenSession fail with a raw MCP code.
        pub fn fail_next_open(&self, code: u32) {
            self.state.lock().unwrap().fail_next_open = Some(code);
        }

        /// Payload the next notified session echoes back (one-shot).
        pub fn set_notify_payload(&self, payload: i32) {
            self.state.lock().unwrap().next_notify_payload = payload;
        }

        pub fn l2_count(&self) -> usize {
            self.state.lock().unwrap().l2.len()
        }

        pub fn shared_count(&self) -> usize {
            self.state.lock().unwrap().shared.len()
        }

        pub fn locked_count(&self) -> usize {
            self.state.lock().unwrap().locked.len()
        }

        pub fn session_count(&self) -> usize {
            self.state.lock().unwrap().sessions.len()
        }

        pub fn version_queries(&self) -> u32 {
            self.state.lock().unwrap().version_queries
        }

        /// Drain NWd→MC, run MCP commands, echo session notifications.
        fn process_nsiq(&self) {
            let mci = self.mci();
            let nq_in = NotificationQueue::new(mci, NQ_IN_OFFSET, NQ_NUM_ELEMS);
            let nq_out = NotificationQueue::new(mci, NQ_OUT_OFFSET, NQ_NUM_ELEMS);

            let mut raised = false;
            let mut state = self.state.lock().unwrap();
            while let Some(record) = nq_in.get() {
                if record.session_id == SID_MCP {
                    process_mcp(&mut state, mci);
                    nq_out
                        .put(NotificationRecord {
                            session_id: SID_MCP,
                            payload: 0,
                        })
                        .unwrap();
                    raised = true;
                } else if state.sessions.contains(&record.session_id) {
                    let payload = std::mem::replace(&mut state.next_notify_payload, 0);
                    nq_out
                        .put(NotificationRecord {
                            session_id: record.session_id,
                            payload,
                        })
                        .unwrap();
                    raised = true;
                }
            }
            drop(state);

            if raised {
                self.raise_ssiq();
            }
        }
    }

    fn process_mcp(state: &mut State, mci: MciRegion) {
        let msg = MCP_MESSAGE_OFFSET;
        let id = mci.read_u32(msg + layout::ID);
        let cmd = match McpCmd::try_from(id) {
            Ok(cmd) => cmd,
            Err(_) => return,
        };

        let result = match cmd {
            McpCmd::OpenSession => match state.fail_next_open.take() {
                Some(code) => code,
                None => {
                    let blob_len = mci.read_u32(msg + layout::OPEN_BLOB_LEN);
                    let tci_phys = mci.read_u64(msg + layout::OPEN_TCI_PHYS);
                    if blob_len == 0 || tci_phys == 0 {
                        1
                    } else {
                        let session_id = state.next_session;
                        state.next_session += 1;
                        state.sessions.insert(session_id);
                        mci.write_u32(msg + layout::OPEN_RSP_SESSION_ID, session_id);
                        MCP_RET_OK
                    }
                }
            },
            McpCmd::CloseSession => {
                let session_id = mci.read_u32(msg + layout::CLOSE_SESSION_ID);
                if state.sessions.remove(&session_id) {
                    MCP_RET_OK
                } else {
                    3
                }
            }
            McpCmd::Map => {
                let session_id = mci.read_u32(msg + layout::MAP_SESSION_ID);
                if state.sessions.contains(&session_id) {
                    let secure_virt = state.next_secure_virt;
                    state.next_secure_virt += 0x1000;
                    mci.write_u32(msg + layout::MAP_RSP_SECURE_VIRT, secure_virt);
                    MCP_RET_OK
                } else {
                    3
                }
            }
            McpCmd::Unmap => MCP_RET_OK,
            McpCmd::GetVersion => {
                state.version_queries += 1;
                let mut info = VersionInfo {
                    product_id: [0; 64],
                    version_mci: MCI_VERSION,
                    version_so: make_version(2, 0),
                    version_mclf: make_version(2, 1),
                    version_container: make_version(2, 0),
                    version_mc_config: make_version(1, 0),
                    version_tl_api: make_version(1, 1),
                    version_dr_api: make_version(1, 0),
                    version_cmp: make_version(1, 0),
                };
                info.product_id[..8].copy_from_slice(b"FAKE-TEE");
                mci.write_bytes(msg + layout::VERSION_RSP_INFO, info.as_bytes());
                MCP_RET_OK
            }
        };

        mci.write_u32(msg + layout::RSP_RESULT, result);
        mci.write_u32(msg + layout::ID, id | FLAG_RESPONSE);
    }

    impl State {
        fn alloc_handle(&mut self) -> u32 {
            let handle = self.next_handle;
            self.next_handle += 1;
            handle
        }
    }

    fn kmod_err(errno: i32) -> Error {
        Error::Kmod(Errno(errno))
    }

    impl Kmod for FakeKmod {
        fn map_shared(&self, len: u32) -> McResult<Wsm> {
            if len == 0 {
                return Err(kmod_err(libc::EINVAL));
            }
            let mut state = self.state.lock().unwrap();
            let handle = state.alloc_handle();
            let mem = vec![0u8; len as usize].into_boxed_slice();
            let virt = mem.as_ptr() as u64;
            let phys = 0x8000_0000u64 + u64::from(handle) * 0x1_0000;
            state.shared.insert(
                handle,
                SharedBuf {
                    _mem: mem,
                    virt,
                    phys,
                    len,
                },
            );
            Ok(Wsm::new(virt, phys, handle, len))
        }

        fn map_mci(&self, len: u32) -> McResult<(Wsm, bool)> {
            assert_eq!(len as usize, MCI_BUFFER_SIZE);
            let mut state = self.state.lock().unwrap();
            let reused = state.mci_mapped;
            state.mci_mapped = true;
            let wsm = Wsm::new(self.mci_mem.get() as u64, 0x1000, 0, len);
            Ok((wsm, reused))
        }

        fn register_l2(&self, virt: u64, len: u32, _pid: u32) -> McResult<L2Registration> {
            if virt == 0 || len == 0 {
                return Err(kmod_err(libc::EINVAL));
            }
            let mut state = self.state.lock().unwrap();
            let handle = state.alloc_handle();
            state.l2.insert(handle, virt);
            Ok(L2Registration {
                handle,
                table_phys: 0x4000_0000 + u64::from(handle) * 0x1000,
            })
        }

        fn unregister_l2(&self, handle: u32) -> McResult<()> {
            let mut state = self.state.lock().unwrap();
            state.locked.remove(&handle);
            state
                .l2
                .remove(&handle)
                .map(|_| ())
                .ok_or_else(|| kmod_err(libc::ENOENT))
        }

        fn lock_l2(&self, handle: u32) -> McResult<()> {
            let mut state = self.state.lock().unwrap();
            if !state.shared.contains_key(&handle) && !state.l2.contains_key(&handle) {
                return Err(kmod_err(libc::ENOENT));
            }
            state.locked.insert(handle);
            Ok(())
        }

        fn unlock_l2(&self, handle: u32) -> McResult<()> {
            let mut state = self.state.lock().unwrap();
            state
                .locked
                .remove(&handle)
                .then_some(())
                .ok_or_else(|| kmod_err(libc::ENOENT))
        }

        fn find_l2(&self, handle: u32) -> McResult<u64> {
            let state = self.state.lock().unwrap();
            state
                .l2
                .get(&handle)
                .map(|_| 0x4000_0000 + u64::from(handle) * 0x1000)
                .ok_or_else(|| kmod_err(libc::ENOENT))
        }

        fn find_contiguous(&self, handle: u32) -> McResult<(u64, u32)> {
            let state = self.state.lock().unwrap();
            state
                .shared
                .get(&handle)
                .map(|buf| (buf.phys, buf.len))
                .ok_or_else(|| kmod_err(libc::ENOENT))
        }

        fn free(&self, wsm: Wsm) -> McResult<()> {
            let mut state = self.state.lock().unwrap();
            let handle = wsm.handle();
            let removed = state.shared.remove(&handle);
            match removed {
                Some(buf) => {
                    assert_eq!(buf.virt, wsm.virt());
                    Ok(())
                }
                None => Err(kmod_err(libc::ENOENT)),
            }
        }

        fn fc_init(
            &self,
            _nq_offset: u32,
            _nq_length: u32,
            _mcp_offset: u32,
            _mcp_length: u32,
        ) -> McResult<()> {
            Ok(())
        }

        fn fc_yield(&self) -> McResult<()> {
            Ok(())
        }

        fn fc_nsiq(&self) -> McResult<()> {
            self.process_nsiq();
            Ok(())
        }

        fn fc_info(&self, ext_info_id: u32) -> McResult<(u32, u32)> {
            let state = SecureWorldStatus::Initialized as u32;
            match ext_info_id {
                EXT_INFO_ID_MCI_VERSION => Ok((state, MCI_VERSION)),
                _ => Ok((state, 0)),
            }
        }

        fn wait_ssiq(&self) -> McResult<u32> {
            let mut ssiq = self.ssiq.lock().unwrap();
            loop {
                if ssiq.shutdown {
                    return Err(kmod_err(libc::EINTR));
                }
                if ssiq.pending > 0 {
                    ssiq.pending -= 1;
                    ssiq.counter += 1;
                    return Ok(ssiq.counter);
                }
                ssiq = self.ssiq_cv.wait(ssiq).unwrap();
            }
        }

        fn cleanup_l2(&self) -> McResult<()> {
            Ok(())
        }

        fn version(&self) -> McResult<u32> {
            Ok(KMOD_API_VERSION)
        }
    }
}

struct Harness {
    fake: Arc<FakeKmod>,
    device: Arc<Device>,
    ctx: DaemonContext,
    uuid: Uuid,
    socket: String,
    _registry_dir: TempDir,
}

fn write_container(path: &std::path::Path, len: usize, parent: u32) {
    let mut data = vec![0u8; len];
    data[..4].copy_from_slice(SO_MAGIC);
    data[SO_PARENT_OFFSET..SO_PARENT_OFFSET + 4].copy_from_slice(&parent.to_le_bytes());
    std::fs::write(path, data).unwrap();
}

fn populate_registry(dir: &std::path::Path, uuid: &Uuid, spid: u32) {
    write_container(&dir.join("00000000.rootcont"), SO_ROOT_CONT_SIZE, 0);
    write_container(&dir.join(format!("{spid:08x}.spcont")), SO_SP_CONT_SIZE, 0);
    write_container(
        &dir.join(format!("{}.tlcont", uuid.hex())),
        SO_TLT_CONT_SIZE,
        spid,
    );

    let mut binary = MCLF_MAGIC.to_vec();
    binary.extend_from_slice(&[0x5A; 124]);
    std::fs::write(dir.join(format!("{}.tlbin", uuid.hex())), binary).unwrap();
}

fn harness(name: &str) -> Harness {
    let socket = format!("mcbroker-test-{name}-{}", std::process::id());
    let fake = FakeKmod::new();

    let registry_dir = tempfile::tempdir().unwrap();
    let uuid = Uuid([0x42; 16]);
    populate_registry(registry_dir.path(), &uuid, 0x99);

    let device = Device::with_kmod(0, fake.clone(), true).unwrap();
    device.start().unwrap();

    let broker = Arc::new(Broker::new(Registry::with_path(registry_dir.path())));
    broker.add_device(device.clone());

    let mut server = Server::bind(&socket, ConnectionHandler::new(broker)).unwrap();
    thread::spawn(move || {
        let _ = server.run();
    });

    let ctx = DaemonContext::with_kmod(
        ClientConfig {
            socket: socket.clone(),
            ..Default::default()
        },
        fake.clone(),
    );

    Harness {
        fake,
        device,
        ctx,
        uuid,
        socket,
        _registry_dir: registry_dir,
    }
}

fn open_session(h: &Harness, tci_len: u32) -> (SessionHandle, *mut u8) {
    let tci = h.ctx.malloc_wsm(0, 4096).unwrap();
    let handle = h.ctx.open_session(0, &h.uuid, tci, tci_len).unwrap();
    (handle, tci)
}

fn settle() {
    thread::sleep(Duration::from_millis(200));
}

#[test]
fn happy_path_round_trip() {
    let h = harness("happy");

    h.ctx.open_device(0).unwrap();
    let tci = h.ctx.malloc_wsm(0, 4096).unwrap();
    let session = h.ctx.open_session(0, &h.uuid, tci, 100).unwrap();

    h.ctx.notify(&session).unwrap();
    h.ctx.wait_notification(&session, -1).unwrap();

    h.ctx.close_session(&session).unwrap();
    h.ctx.free_wsm(0, tci).unwrap();
    h.ctx.close_device(0).unwrap();

    assert_eq!(h.fake.session_count(), 0);
    assert_eq!(h.fake.l2_count(), 0);
    assert_eq!(h.fake.shared_count(), 0);
    assert_eq!(h.fake.locked_count(), 0);

    h.fake.shutdown();
    h.device.stop();
}

#[test]
fn terminal_notification_reports_exit_code() {
    let h = harness("terminal");
    h.ctx.open_device(0).unwrap();
    let (session, _tci) = open_session(&h, 64);

    h.fake.set_notify_payload(0xDEAD);
    h.ctx.notify(&session).unwrap();

    assert_eq!(
        h.ctx.wait_notification(&session, -1),
        Err(Error::InfoNotification)
    );
    assert_eq!(h.ctx.session_error_code(&session).unwrap(), 0xDEAD);
}

#[test]
fn dropped_client_is_cleaned_up_and_device_reopens() {
    let h = harness("staleclose");

    h.ctx.open_device(0).unwrap();
    let (session, _tci) = open_session(&h, 64);

    let buf = vec![0u8; 8192];
    let info = h
        .ctx
        .map(&session, buf.as_ptr() as *mut u8, buf.len() as u32)
        .unwrap();
    assert_ne!(info.secure_virt, 0);
    assert_eq!(h.fake.l2_count(), 1);

    // Client process "dies": both its sockets close.
    let fake = h.fake.clone();
    let socket = h.socket.clone();
    drop(h.ctx);
    settle();

    assert_eq!(fake.session_count(), 0);
    assert_eq!(fake.l2_count(), 0);

    // A second client can use the device immediately.
    let ctx2 = DaemonContext::with_kmod(
        ClientConfig {
            socket,
            ..Default::default()
        },
        fake.clone(),
    );
    ctx2.open_device(0).unwrap();
    let tci = ctx2.malloc_wsm(0, 4096).unwrap();
    let session2 = ctx2.open_session(0, &h.uuid, tci, 64).unwrap();
    ctx2.close_session(&session2).unwrap();
}

#[test]
fn nq_connect_with_bogus_credentials_keeps_the_connection() {
    let h = harness("nqbogus");

    let addr = SocketAddr::from_abstract_name(h.socket.as_bytes()).unwrap();
    let mut stream = UnixStream::connect_addr(&addr).unwrap();

    let cmd = NqConnectCmd {
        cmd_id: Command::NqConnect.into(),
        device_id: 0,
        session_id: 42,
        device_session_id: 0xAAAA,
        session_magic: 0xBBBB,
    };
    stream.write_all(cmd.as_bytes()).unwrap();

    let mut code = [0u8; 4];
    stream.read_exact(&mut code).unwrap();
    assert_eq!(
        u32::from_le_bytes(code),
        Error::UnknownSession.code(),
        "bogus pair must be rejected"
    );

    // The server kept the connection alive: it still answers.
    let cmd = GetVersionCmd {
        cmd_id: Command::GetVersion.into(),
    };
    stream.write_all(cmd.as_bytes()).unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(u32::from_le_bytes(reply[..4].try_into().unwrap()), 0);
    assert_eq!(
        u32::from_le_bytes(reply[4..].try_into().unwrap()),
        DAEMON_VERSION
    );
}

#[test]
fn early_notification_is_buffered_until_nq_connect() {
    let h = harness("race");
    h.ctx.open_device(0).unwrap();

    // The secure world races the daemon's session table: a record for
    // the session id the next open will get arrives first.
    h.fake.inject_notification(1, 0);
    thread::sleep(Duration::from_millis(50));

    let (session, _tci) = open_session(&h, 64);
    assert_eq!(session.session_id, 1);

    // The buffered record must be the first thing on the new channel.
    h.ctx.wait_notification(&session, 500).unwrap();
}

#[test]
fn double_open_is_refused() {
    let h = harness("doubleopen");
    h.ctx.open_device(0).unwrap();
    assert_eq!(h.ctx.open_device(0), Err(Error::DeviceAlreadyOpen));
}

#[test]
fn tci_length_checks() {
    let h = harness("tcilen");
    h.ctx.open_device(0).unwrap();
    let tci = h.ctx.malloc_wsm(0, 4096).unwrap();

    assert_eq!(
        h.ctx.open_session(0, &h.uuid, tci, MAX_TCI_LEN + 1),
        Err(Error::TciTooBig)
    );
    assert_eq!(
        h.ctx.open_session(0, &h.uuid, tci, 8192),
        Err(Error::TciGreaterThanWsm)
    );

    // Neither attempt may leave state behind.
    assert_eq!(h.fake.session_count(), 0);
    assert_eq!(h.fake.locked_count(), 0);
}

#[test]
fn wait_with_zero_timeout_times_out_first_try() {
    let h = harness("waitzero");
    h.ctx.open_device(0).unwrap();
    let (session, _tci) = open_session(&h, 64);

    assert_eq!(h.ctx.wait_notification(&session, 0), Err(Error::Timeout));

    let start = Instant::now();
    assert_eq!(h.ctx.wait_notification(&session, 50), Err(Error::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn close_device_refused_while_session_open() {
    let h = harness("closedev");
    h.ctx.open_device(0).unwrap();
    let (session, tci) = open_session(&h, 64);

    assert_eq!(h.ctx.close_device(0), Err(Error::SessionPending));

    h.ctx.close_session(&session).unwrap();
    h.ctx.free_wsm(0, tci).unwrap();
    h.ctx.close_device(0).unwrap();
}

#[test]
fn map_then_unmap_returns_l2_table_to_prior_state() {
    let h = harness("mapunmap");
    h.ctx.open_device(0).unwrap();
    let (session, _tci) = open_session(&h, 64);
    assert_eq!(h.fake.l2_count(), 0);

    let buf = vec![0u8; 16384];
    let ptr = buf.as_ptr() as *mut u8;

    let info = h.ctx.map(&session, ptr, buf.len() as u32).unwrap();
    assert_eq!(h.fake.l2_count(), 1);

    // Unknown buffers are rejected without touching the kernel.
    let bogus = 0x1234 as *mut u8;
    assert_eq!(
        h.ctx.unmap(&session, bogus, &info),
        Err(Error::BulkBufferNotFound)
    );

    h.ctx.unmap(&session, ptr, &info).unwrap();
    assert_eq!(h.fake.l2_count(), 0);
}

#[test]
fn mcp_rejection_leaves_no_trace() {
    let h = harness("mcpreject");
    h.ctx.open_device(0).unwrap();
    let tci = h.ctx.malloc_wsm(0, 4096).unwrap();

    h.fake.fail_next_open(MCP_RET_ERR_CONTAINER_LOCKED);
    assert_eq!(
        h.ctx.open_session(0, &h.uuid, tci, 64),
        Err(Error::Mcp(McpError::ContainerLocked))
    );

    assert_eq!(h.fake.session_count(), 0);
    assert_eq!(h.fake.l2_count(), 0);
    assert_eq!(h.fake.locked_count(), 0);
}

#[test]
fn secure_world_version_is_cached() {
    let h = harness("version");
    h.ctx.open_device(0).unwrap();

    let info = h.ctx.mobicore_version(0).unwrap();
    assert!(info.product_id.starts_with(b"FAKE-TEE"));

    let again = h.ctx.mobicore_version(0).unwrap();
    assert_eq!(again.product_id, info.product_id);
    assert_eq!(h.fake.version_queries(), 1, "second query must be cached");
}

#[test]
fn notifications_are_fifo_per_session() {
    let h = harness("fifo");
    h.ctx.open_device(0).unwrap();
    let (session, _tci) = open_session(&h, 64);

    for _ in 0..3 {
        h.ctx.notify(&session).unwrap();
    }
    settle();

    // One wait drains all three records without error.
    h.ctx.wait_notification(&session, 500).unwrap();
    // Queue fully drained now.
    assert_eq!(h.ctx.wait_notification(&session, 0), Err(Error::Timeout));
}
