//! Live Sequence Protocol (LSP): a reliable, ordered, message-oriented
//! transport layered over UDP.
//!
//! An LSP connection gives callers exactly-once (until declared lost)
//! delivery of whole messages over an unreliable, unordered datagram
//! substrate, by combining per-frame acknowledgement and retransmission, a
//! sliding window for flow control, and an epoch clock for liveness
//! detection. [`Client::dial`] opens a single connection to a server;
//! [`Server::listen`] accepts connections from many peers at once.
//!
//! ```rust,no_run
//! use lsp::{Client, Params};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::dial("127.0.0.1:7000", Params::default()).await?;
//!     client.write(b"hello".to_vec()).await?;
//!     let reply = client.read().await?;
//!     println!("got {} bytes back", reply.len());
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod params;
pub mod server;
mod socket;

pub use client::Client;
pub use codec::CodecError;
pub use connection::{ConnStatus, Delivery};
pub use error::{LspError, Result};
pub use frame::{Frame, FrameKind};
pub use params::Params;
pub use server::Server;
