// ABOUTME: Server-only acceptor: owns the receive loop, the conn_id allocator, and the
// ABOUTME: peer_address -> conn_id index used to detect duplicate Connects

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec;
use crate::connection::{self, ConnectionHandle, Delivery};
use crate::frame::{Frame, FrameKind};
use crate::params::Params;

/// Identifier allocation only needs to be unique for the endpoint's
/// lifetime, not dense; 73 is an arbitrary non-zero starting point.
const INITIAL_CONN_ID: u32 = 73;

const RECV_BUF_SIZE: usize = 4096;

/// The shared table of live connections, indexed both by `conn_id` (for
/// `write`/`close_conn`) and by `peer_address` (for duplicate-Connect
/// detection). Mutated only by the acceptor task.
pub struct ConnectionTable {
    inner: Mutex<ConnectionTableInner>,
}

struct ConnectionTableInner {
    by_id: HashMap<u32, Arc<ConnectionHandle>>,
    by_addr: HashMap<SocketAddr, u32>,
    next_conn_id: u32,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConnectionTableInner {
                by_id: HashMap::new(),
                by_addr: HashMap::new(),
                next_conn_id: INITIAL_CONN_ID,
            }),
        }
    }

    pub fn get(&self, conn_id: u32) -> Option<Arc<ConnectionHandle>> {
        self.inner.lock().expect("table mutex poisoned").by_id.get(&conn_id).cloned()
    }

    pub fn remove(&self, conn_id: u32) {
        let mut inner = self.inner.lock().expect("table mutex poisoned");
        if let Some(handle) = inner.by_id.remove(&conn_id) {
            inner.by_addr.remove(&handle.peer_addr);
        }
    }

    pub fn all_ids(&self) -> Vec<u32> {
        self.inner
            .lock()
            .expect("table mutex poisoned")
            .by_id
            .keys()
            .copied()
            .collect()
    }

    fn insert(&self, handle: Arc<ConnectionHandle>) {
        let mut inner = self.inner.lock().expect("table mutex poisoned");
        inner.by_addr.insert(handle.peer_addr, handle.conn_id);
        inner.by_id.insert(handle.conn_id, handle);
    }

    fn existing_id_for(&self, addr: &SocketAddr) -> Option<u32> {
        self.inner
            .lock()
            .expect("table mutex poisoned")
            .by_addr
            .get(addr)
            .copied()
    }

    fn allocate_id(&self) -> u32 {
        let mut inner = self.inner.lock().expect("table mutex poisoned");
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        id
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the server's receive loop: decodes datagrams, routes `Connect`s (and
/// any frame with an unrecognized `conn_id`) through [`handle_connect`] /
/// drops them, and forwards everything else to the matching connection's
/// inbound queue.
pub async fn run(
    socket: Arc<UdpSocket>,
    table: Arc<ConnectionTable>,
    params: Params,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Frame)>,
    deliver_tx: mpsc::UnboundedSender<Delivery>,
    retired_tx: mpsc::Sender<u32>,
) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "server socket read error");
                continue;
            }
        };

        let frame = match codec::decode(&buf[..n]) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%addr, %err, "dropping malformed datagram");
                continue;
            }
        };

        match frame.kind {
            FrameKind::Connect => {
                handle_connect(
                    addr,
                    &table,
                    params,
                    &outbound_tx,
                    &deliver_tx,
                    &retired_tx,
                );
            }
            _ => match table.get(frame.conn_id) {
                Some(handle) => {
                    if handle.inbound_tx.send(frame).is_err() {
                        debug!(conn_id = handle.conn_id, "connection task already gone");
                    }
                }
                None => {
                    debug!(conn_id = frame.conn_id, %addr, "dropping frame for unknown connection");
                }
            },
        }
    }
}

/// Admits a new peer, or re-sends the existing Connect-Ack if `addr` already
/// has a connection.
fn handle_connect(
    addr: SocketAddr,
    table: &Arc<ConnectionTable>,
    params: Params,
    outbound_tx: &mpsc::UnboundedSender<(SocketAddr, Frame)>,
    deliver_tx: &mpsc::UnboundedSender<Delivery>,
    retired_tx: &mpsc::Sender<u32>,
) {
    if let Some(conn_id) = table.existing_id_for(&addr) {
        outbound_tx.send((addr, Frame::ack(conn_id, 0))).ok();
        return;
    }

    let conn_id = table.allocate_id();
    let handle = connection::spawn(
        conn_id,
        addr,
        params,
        outbound_tx.clone(),
        deliver_tx.clone(),
        retired_tx.clone(),
    );
    table.insert(Arc::new(handle));
    outbound_tx.send((addr, Frame::ack(conn_id, 0))).ok();
}
