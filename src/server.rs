// ABOUTME: Public server endpoint: accepts connections from many peers and multiplexes
// ABOUTME: reads/writes across them by conn_id. The acceptor and a reaper task run alongside it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::acceptor::{self, ConnectionTable};
use crate::connection::{ConnStatus, Delivery};
use crate::error::{LspError, Result};
use crate::params::Params;
use crate::socket;

/// A listening LSP endpoint serving many connections at once.
///
/// [`Server::read`] yields `(conn_id, payload)` pairs across every live
/// connection in delivery order per-connection (no ordering guarantee
/// between different connections); [`Server::write`] and
/// [`Server::close_conn`] address a specific connection by the `conn_id` it
/// was assigned on accept.
pub struct Server {
    table: Arc<ConnectionTable>,
    deliver_rx: AsyncMutex<mpsc::UnboundedReceiver<Delivery>>,
    retirement: Arc<Notify>,
    local_addr: SocketAddr,
    _reaper_task: JoinHandle<()>,
    _acceptor_task: JoinHandle<()>,
    _writer_task: JoinHandle<()>,
    _socket: Arc<UdpSocket>,
}

impl Server {
    /// Binds `addr` and starts accepting connections.
    pub async fn listen<A: ToSocketAddrs>(addr: A, params: Params) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let table = Arc::new(ConnectionTable::new());
        let retirement = Arc::new(Notify::new());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (retired_tx, mut retired_rx) = mpsc::channel(256);

        let writer_task = socket::spawn_writer(socket.clone(), outbound_rx);
        let acceptor_task = tokio::spawn(acceptor::run(
            socket.clone(),
            table.clone(),
            params,
            outbound_tx,
            deliver_tx,
            retired_tx,
        ));

        // A connection's retirement (HandlerClosed or Lost) is the only
        // signal that its conn_id and peer_address should leave the table;
        // without this, a peer whose connection is later declared Lost
        // could never reconnect, since the stale peer_address entry would
        // keep matching as a duplicate Connect.
        let reaper_table = table.clone();
        let reaper_notify = retirement.clone();
        let reaper_task = tokio::spawn(async move {
            while let Some(conn_id) = retired_rx.recv().await {
                reaper_table.remove(conn_id);
                reaper_notify.notify_waiters();
            }
        });

        Ok(Server {
            table,
            deliver_rx: AsyncMutex::new(deliver_rx),
            retirement,
            local_addr,
            _reaper_task: reaper_task,
            _acceptor_task: acceptor_task,
            _writer_task: writer_task,
            _socket: socket,
        })
    }

    /// The address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for and returns the next in-order payload from any connection.
    pub async fn read(&self) -> Result<(u32, Vec<u8>)> {
        let mut rx = self.deliver_rx.lock().await;
        match rx.recv().await {
            Some(Delivery::Payload { conn_id, payload }) => Ok((conn_id, payload)),
            Some(Delivery::Lost { conn_id }) => Err(LspError::ConnectionLost { conn_id }),
            None => Err(LspError::EndpointClosed),
        }
    }

    /// Queues `payload` for delivery on `conn_id`.
    pub async fn write(&self, conn_id: u32, payload: Vec<u8>) -> Result<()> {
        let handle = self
            .table
            .get(conn_id)
            .ok_or(LspError::ConnectionLost { conn_id })?;
        handle
            .write_tx
            .send(payload)
            .await
            .map_err(|_| LspError::ConnectionLost { conn_id })
    }

    /// Requests a graceful close of a single connection; already-queued data
    /// is still sent and acknowledged before it retires. No-op if the
    /// connection is already gone.
    pub async fn close_conn(&self, conn_id: u32) -> Result<()> {
        if let Some(handle) = self.table.get(conn_id) {
            handle.close_tx.send(()).await.ok();
        }
        Ok(())
    }

    /// Requests a graceful close of every live connection, waits for all of
    /// them to drain, then tears down the socket, per the endpoint-level
    /// close contract.
    pub async fn close(&self) -> Result<()> {
        let mut handles = Vec::new();
        for conn_id in self.table.all_ids() {
            if let Some(handle) = self.table.get(conn_id) {
                handle.close_tx.send(()).await.ok();
                handles.push(handle);
            }
        }

        loop {
            let notified = self.retirement.notified();
            if self.table.all_ids().is_empty() {
                break;
            }
            notified.await;
        }

        for handle in handles {
            handle.status.force(ConnStatus::SocketClosed);
        }

        Ok(())
    }
}
