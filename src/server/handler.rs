// SPDX-License-Identifier: Apache-2.0

//! Per-connection command handling.
//!
//! A connection starts `Fresh` and is narrowed by its first meaningful
//! command: `OpenDevice` turns it into a device command channel,
//! `NqConnect` turns it into a session notification channel. Domain
//! errors are replied and keep the connection; socket errors and framing
//! violations propagate and the server drops the peer.

use std::mem::size_of;
use std::sync::Arc;

use tracing::{debug, warn};
use zerocopy::{Immutable, IntoBytes};

use crate::error::{Error, McResult, CODE_OK};
use crate::proto::{
    CloseDeviceCmd, CloseSessionCmd, Command, GetMobicoreVersionCmd, GetVersionCmd, GetVersionRsp,
    MapBulkCmd, MapBulkRsp, NotifyCmd, NqConnectCmd, OpenDeviceCmd, OpenSessionCmd, ResponseHeader,
    UnmapBulkCmd, DAEMON_VERSION, MAX_TCI_LEN,
};

use super::connection::Connection;
use super::Broker;

/// Where a connection is in its lifecycle.
#[derive(Clone, Copy, Debug)]
pub enum ConnState {
    Fresh,
    DeviceBound(u32),
    NqBound { device_id: u32, session_id: u32 },
}

/// One accepted peer plus its protocol state.
pub struct Peer {
    pub conn: Arc<Connection>,
    pub state: ConnState,
}

impl Peer {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
            state: ConnState::Fresh,
        }
    }
}

/// Stateless dispatcher; all state lives on the peer and the broker.
pub struct ConnectionHandler {
    broker: Arc<Broker>,
}

impl ConnectionHandler {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Service one readable event on `peer`. An `Err` drops the
    /// connection.
    pub fn handle(&self, peer: &mut Peer) -> McResult<()> {
        if let ConnState::NqBound { .. } = peer.state {
            // Session channels carry no further requests; traffic or
            // EOF both end the channel.
            return Err(Error::SocketRead);
        }

        let raw = peer.conn.read_u32()?;
        let cmd = Command::try_from(raw).map_err(|_| {
            debug!(raw, "unknown command id, dropping connection");
            Error::NotImplemented
        })?;

        match cmd {
            Command::GetVersion => {
                let _cmd: GetVersionCmd = peer.conn.read_command(raw)?;
                self.reply_payload(
                    peer,
                    &GetVersionRsp {
                        version: DAEMON_VERSION,
                    },
                )
            }

            Command::OpenDevice => {
                let cmd: OpenDeviceCmd = peer.conn.read_command(raw)?;
                let outcome = match peer.state {
                    ConnState::DeviceBound(_) => Err(Error::DeviceAlreadyOpen),
                    _ => match self.broker.device(cmd.device_id) {
                        Some(_) => Ok(cmd.device_id),
                        None => Err(Error::UnknownDevice),
                    },
                };
                match outcome {
                    Ok(device_id) => {
                        peer.state = ConnState::DeviceBound(device_id);
                        self.reply_ok(peer)
                    }
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::CloseDevice => {
                let _cmd: CloseDeviceCmd = peer.conn.read_command(raw)?;
                let outcome = match self.bound_device(peer) {
                    Err(err) => Err(err),
                    Ok(device) => {
                        if device.has_sessions_for(peer.conn.id()) {
                            Err(Error::SessionPending)
                        } else {
                            Ok(())
                        }
                    }
                };
                match outcome {
                    Ok(()) => {
                        peer.state = ConnState::Fresh;
                        self.reply_ok(peer)
                    }
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::OpenSession => {
                let cmd: OpenSessionCmd = peer.conn.read_command(raw)?;
                let outcome = self.bound_device(peer).and_then(|device| {
                    if cmd.tci_len > MAX_TCI_LEN {
                        return Err(Error::TciTooBig);
                    }
                    let blob = self.broker.registry().service_blob(&cmd.uuid)?;
                    device.open_session(
                        peer.conn.id(),
                        &cmd.uuid,
                        cmd.tci_handle,
                        cmd.tci_len,
                        &blob,
                    )
                });
                match outcome {
                    Ok(rsp) => self.reply_payload(peer, &rsp),
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::CloseSession => {
                let cmd: CloseSessionCmd = peer.conn.read_command(raw)?;
                let outcome = self
                    .bound_device(peer)
                    .and_then(|device| device.close_session(cmd.session_id));
                match outcome {
                    Ok(()) => self.reply_ok(peer),
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::Notify => {
                // One-way; nothing is ever written back.
                let cmd: NotifyCmd = peer.conn.read_command(raw)?;
                if let Ok(device) = self.bound_device(peer) {
                    if let Err(err) = device.notify(cmd.session_id) {
                        debug!(session_id = cmd.session_id, %err, "notify dropped");
                    }
                }
                Ok(())
            }

            Command::MapBulkBuf => {
                let cmd: MapBulkCmd = peer.conn.read_command(raw)?;
                let pid = peer.conn.peer_pid()?;
                let outcome = self
                    .bound_device(peer)
                    .and_then(|device| device.map_bulk(cmd.session_id, cmd.client_virt, cmd.len, pid));
                match outcome {
                    Ok(secure_virt) => self.reply_payload(peer, &MapBulkRsp { secure_virt }),
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::UnmapBulkBuf => {
                let cmd: UnmapBulkCmd = peer.conn.read_command(raw)?;
                let outcome = self
                    .bound_device(peer)
                    .and_then(|device| device.unmap_bulk(cmd.session_id, cmd.secure_virt, cmd.len));
                match outcome {
                    Ok(()) => self.reply_ok(peer),
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::GetMobicoreVersion => {
                let _cmd: GetMobicoreVersionCmd = peer.conn.read_command(raw)?;
                let outcome = self
                    .bound_device(peer)
                    .and_then(|device| device.mobicore_version());
                match outcome {
                    Ok(info) => self.reply_payload(peer, &info),
                    Err(err) => self.reply_err(peer, &err),
                }
            }

            Command::NqConnect => {
                let cmd: NqConnectCmd = peer.conn.read_command(raw)?;
                let outcome = match self.broker.device(cmd.device_id) {
                    None => Err(Error::UnknownDevice),
                    Some(device) => {
                        device.connect_nq(cmd.session_id, cmd.device_session_id, cmd.session_magic)
                    }
                };
                match outcome {
                    Ok(()) => {
                        // Reply first: buffered notifications must land
                        // behind the response on the socket.
                        self.reply_ok(peer)?;
                        let device = self
                            .broker
                            .device(cmd.device_id)
                            .ok_or(Error::UnknownDevice)?;
                        device.attach_nq(cmd.session_id, peer.conn.clone())?;
                        peer.state = ConnState::NqBound {
                            device_id: cmd.device_id,
                            session_id: cmd.session_id,
                        };
                        Ok(())
                    }
                    Err(err) => self.reply_err(peer, &err),
                }
            }
        }
    }

    /// The server lost this peer; release whatever its role pinned.
    pub fn drop_connection(&self, peer: &Peer) {
        match peer.state {
            ConnState::Fresh => {}
            ConnState::DeviceBound(device_id) => {
                if let Some(device) = self.broker.device(device_id) {
                    warn!(device_id, conn = peer.conn.id(), "device channel lost");
                    device.drop_device_connection(peer.conn.id());
                }
            }
            ConnState::NqBound { device_id, .. } => {
                if let Some(device) = self.broker.device(device_id) {
                    device.drop_nq_connection(peer.conn.id());
                }
            }
        }
    }

    fn bound_device(&self, peer: &Peer) -> McResult<Arc<crate::device::Device>> {
        match peer.state {
            ConnState::DeviceBound(device_id) => {
                self.broker.device(device_id).ok_or(Error::UnknownDevice)
            }
            _ => Err(Error::UnknownDevice),
        }
    }

    fn reply_ok(&self, peer: &Peer) -> McResult<()> {
        peer.conn.write_struct(&ResponseHeader { result: CODE_OK })
    }

    fn reply_err(&self, peer: &Peer, err: &Error) -> McResult<()> {
        debug!(conn = peer.conn.id(), %err, "request failed");
        peer.conn.write_struct(&ResponseHeader { result: err.code() })
    }

    /// Header and payload go out in one write so the client never sees a
    /// torn response.
    fn reply_payload<T: IntoBytes + Immutable>(&self, peer: &Peer, payload: &T) -> McResult<()> {
        let mut buf = Vec::with_capacity(size_of::<ResponseHeader>() + size_of::<T>());
        buf.extend_from_slice(ResponseHeader { result: CODE_OK }.as_bytes());
        buf.extend_from_slice(payload.as_bytes());
        peer.conn.write_bytes(&buf)
    }
}
