// ABOUTME: Public client endpoint: dials a server, then exposes read/write/close over the
// ABOUTME: resulting connection. The handshake runs before any connection task exists.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::codec;
use crate::connection::{self, ConnStatus, ConnectionHandle, Delivery};
use crate::error::{LspError, Result};
use crate::frame::{Frame, FrameKind};
use crate::params::Params;
use crate::socket;

const HANDSHAKE_RECV_BUF_SIZE: usize = 4096;

/// A dialed LSP connection to a single server.
///
/// A connection is born on receipt of the server's Connect-Ack; there is no
/// client-visible "connecting" state. [`Client::read`] yields payloads in
/// delivery order (gaps buffered and reordered internally); [`Client::write`]
/// queues payloads for outbound sequencing and flow control.
pub struct Client {
    handle: ConnectionHandle,
    deliver_rx: AsyncMutex<mpsc::UnboundedReceiver<Delivery>>,
    retired_rx: AsyncMutex<mpsc::Receiver<u32>>,
    _writer_task: JoinHandle<()>,
    _reader_task: JoinHandle<()>,
    _socket: Arc<UdpSocket>,
}

impl Client {
    /// Dials `addr`, retrying the Connect handshake once per epoch until the
    /// server's Connect-Ack arrives or `params.epoch_limit` epochs elapse.
    pub async fn dial<A: ToSocketAddrs>(addr: A, params: Params) -> Result<Self> {
        let server_addr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| {
                LspError::Setup(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "address did not resolve to any socket address",
                ))
            })?;

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let conn_id = handshake(&socket, server_addr, &params).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (retired_tx, retired_rx) = mpsc::channel(1);

        let writer_task = socket::spawn_writer(socket.clone(), outbound_rx);
        let handle = connection::spawn(
            conn_id,
            server_addr,
            params,
            outbound_tx,
            deliver_tx,
            retired_tx,
        );
        let reader_task = socket::spawn_client_reader(
            socket.clone(),
            server_addr,
            conn_id,
            handle.inbound_tx.clone(),
        );

        Ok(Client {
            handle,
            deliver_rx: AsyncMutex::new(deliver_rx),
            retired_rx: AsyncMutex::new(retired_rx),
            _writer_task: writer_task,
            _reader_task: reader_task,
            _socket: socket,
        })
    }

    /// The `conn_id` the server assigned this connection.
    pub fn conn_id(&self) -> u32 {
        self.handle.conn_id
    }

    /// Waits for and returns the next in-order payload.
    ///
    /// Returns [`LspError::ConnectionLost`] once the connection's epoch limit
    /// has been exceeded, and [`LspError::EndpointClosed`] once the
    /// connection has fully drained after [`Client::close`].
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut rx = self.deliver_rx.lock().await;
        match rx.recv().await {
            Some(Delivery::Payload { payload, .. }) => Ok(payload),
            Some(Delivery::Lost { conn_id }) => Err(LspError::ConnectionLost { conn_id }),
            None => Err(LspError::EndpointClosed),
        }
    }

    /// Queues `payload` for delivery. Returns as soon as the connection task
    /// accepts it; sequencing and flow control happen there. A write that
    /// races with [`Client::close`] is still drained and delivered — the
    /// connection task keeps reading its write queue while `Draining` so
    /// that nothing queued before the close request is lost. Only a write
    /// issued after the connection has fully retired returns
    /// [`LspError::EndpointClosed`].
    pub async fn write(&self, payload: Vec<u8>) -> Result<()> {
        self.handle
            .write_tx
            .send(payload)
            .await
            .map_err(|_| LspError::EndpointClosed)
    }

    /// Requests a graceful close: no further writes are accepted, but data
    /// already queued is still sent and acknowledged before the connection
    /// task retires. Tears down the socket once the connection has fully
    /// drained, per the endpoint-level close contract.
    pub async fn close(&self) -> Result<()> {
        self.handle.close_tx.send(()).await.ok();
        self.retired_rx.lock().await.recv().await;
        self.handle.status.force(ConnStatus::SocketClosed);
        Ok(())
    }
}

/// Retries a Connect frame once per epoch until the matching Connect-Ack
/// arrives or `params.epoch_limit` is reached.
async fn handshake(socket: &UdpSocket, server_addr: SocketAddr, params: &Params) -> Result<u32> {
    let connect_bytes = codec::encode(&Frame::connect());
    let mut buf = vec![0u8; HANDSHAKE_RECV_BUF_SIZE];

    for _ in 0..params.epoch_limit {
        if socket.send_to(&connect_bytes, server_addr).await.is_err() {
            continue;
        }

        let Ok(Ok((n, from))) = timeout(params.epoch_interval, socket.recv_from(&mut buf)).await
        else {
            // Either the epoch elapsed with no reply, or the read itself
            // failed (e.g. an ICMP port-unreachable for a dead server) —
            // both just cost this epoch's retry.
            continue;
        };
        if from != server_addr {
            continue;
        }

        let Ok(frame) = codec::decode(&buf[..n]) else {
            continue;
        };

        if frame.kind == FrameKind::Ack && frame.seq_num == 0 {
            return Ok(frame.conn_id);
        }
    }

    Err(LspError::HandshakeTimeout {
        epochs: params.epoch_limit,
    })
}
