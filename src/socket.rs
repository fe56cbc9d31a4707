// ABOUTME: Owns the UDP socket: a writer task drains a shared outbound queue, a client reader
// ABOUTME: task demultiplexes the single expected peer. The server's receive loop lives in acceptor.rs,
// ABOUTME: since server-side demux needs the connection table the acceptor owns.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec;
use crate::frame::{Frame, FrameKind};

/// An outbound frame destined for a specific peer address.
pub type OutboundFrame = (SocketAddr, Frame);

/// Maximum UDP datagram this endpoint will attempt to receive.
const RECV_BUF_SIZE: usize = 4096;

/// Spawns the single task that drains `outbound_rx` into `socket`. Shared by
/// every connection task and the acceptor so that only one task ever writes
/// to the socket.
pub fn spawn_writer(
    socket: Arc<UdpSocket>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((addr, frame)) = outbound_rx.recv().await {
            let bytes = codec::encode(&frame);
            if let Err(err) = socket.send_to(&bytes, addr).await {
                warn!(%addr, %err, "failed to send datagram");
            }
        }
    })
}

/// Spawns the client-side receive loop. The client only ever talks to one
/// server address and one `conn_id`, so demultiplexing is trivial: anything
/// else is logged and dropped.
pub fn spawn_client_reader(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    conn_id: u32,
    inbound_tx: mpsc::UnboundedSender<Frame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (n, addr) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "client socket read error");
                    continue;
                }
            };

            if addr != server_addr {
                debug!(%addr, "dropping datagram from unexpected address");
                continue;
            }

            let frame = match codec::decode(&buf[..n]) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%err, "dropping malformed datagram");
                    continue;
                }
            };

            if frame.kind == FrameKind::Connect || frame.conn_id != conn_id {
                debug!(conn_id = frame.conn_id, "dropping frame for unknown connection");
                continue;
            }

            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
    })
}
