// SPDX-License-Identifier: Apache-2.0

//! The UNIX-domain stream server.
//!
//! One listening socket on an abstract address, multiplexed with
//! `poll(2)` over the listener and every established peer. Command
//! channels and notification channels share the address; the first
//! command on a connection decides its role (see
//! [`handler::ConnectionHandler`]).

pub mod connection;
pub mod handler;

use std::collections::HashMap;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{Error, McResult};
use crate::registry::Registry;

use connection::Connection;
use handler::{ConnectionHandler, Peer};

/// The daemon's process context: the device table and the container
/// registry, constructed once at start and handed to every entry point.
pub struct Broker {
    registry: Registry,
    devices: Mutex<HashMap<u32, Arc<Device>>>,
}

impl Broker {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_device(&self, device: Arc<Device>) {
        self.devices.lock().unwrap().insert(device.device_id(), device);
    }

    pub fn device(&self, device_id: u32) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&device_id).cloned()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Accept loop plus request multiplexing, single-threaded by design: one
/// request is drained fully before selecting again, because the MCP
/// channel behind it is a singleton resource anyway.
pub struct Server {
    listener: UnixListener,
    handler: ConnectionHandler,
    peers: Vec<Peer>,
    next_conn_id: u64,
}

impl Server {
    /// Bind the abstract address (no filesystem path, everyone may
    /// connect; access control is the secure world's job).
    pub fn bind(socket_name: &str, handler: ConnectionHandler) -> McResult<Self> {
        let addr = SocketAddr::from_abstract_name(socket_name.as_bytes())
            .map_err(|_| Error::SocketConnect)?;
        let listener = UnixListener::bind_addr(&addr).map_err(|_| Error::SocketConnect)?;

        Ok(Self {
            listener,
            handler,
            peers: Vec::new(),
            next_conn_id: 1,
        })
    }

    /// Serve forever.
    pub fn run(&mut self) -> McResult<()> {
        use std::os::unix::io::AsRawFd;

        info!("server loop running");
        loop {
            let mut fds = Vec::with_capacity(1 + self.peers.len());
            fds.push(libc::pollfd {
                fd: self.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for peer in &self.peers {
                fds.push(libc::pollfd {
                    fd: peer.conn.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(%err, "poll failed, server exiting");
                return Err(Error::SocketRead);
            }

            if fds[0].revents & libc::POLLIN != 0 {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        let id = self.next_conn_id;
                        self.next_conn_id += 1;
                        debug!(conn = id, "client connected");
                        self.peers.push(Peer::new(Connection::new(stream, id)));
                    }
                    // The client has to deal with it; nothing changed
                    // on our side.
                    Err(err) => debug!(%err, "accept failed"),
                }
            }

            // Only the peers that were polled; an accept above may have
            // appended one already.
            let polled = fds.len() - 1;
            let mut index = 0;
            while index < polled {
                let revents = fds[1 + index].revents;
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                    index += 1;
                    continue;
                }

                let peer = &mut self.peers[index];
                if let Err(err) = self.handler.handle(peer) {
                    debug!(conn = peer.conn.id(), %err, "dropping connection");
                    self.handler.drop_connection(peer);
                    self.peers.remove(index);
                    // fds no longer lines up with peers; re-poll.
                    break;
                }
                index += 1;
            }
        }
    }
}
