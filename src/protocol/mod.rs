//! Client-server communication protocol.
//!
//! This module defines the wire protocol spoken between the driver and a query server: the
//! frame codec, the request and response messages, and the transports that carry frames.
//!
//! # Overview
//!
//! Many logical queries share one connection. Every request and response carries the
//! [`Token`](crate::Token) of the query it belongs to, so responses for different queries may
//! interleave freely while the batches of a single query arrive in send order.
//!
//! # Key Components
//!
//! - [`Request`]: `START`, `CONTINUE` and `STOP` messages sent by the client.
//! - [`Response`]: A status code plus a batch of result items, or an error description.
//! - [`Transport`]: The outbound half of a byte stream; [`TcpTransport`] and [`MemoryTransport`]
//!   implement it.
//! - [`ProtocolTransport`]: Blocking frame reader/writer used on the server side.
//! - [`EchoServer`]: A reference server used to exercise the client end to end.
//!
//! # Binary Format
//!
//! - Each frame is a 4-byte little-endian body length followed by the body.
//! - Bodies are bincode encoded with little-endian, fixed-width integers.
//! - Result items travel as JSON documents inside the body.
//!
//! # See Also
//!
//! - [`Connection`](crate::Connection): dispatches decoded responses to cursors.
pub mod codec;
mod request;
mod response;
mod server;
mod thread;
mod transport;

use thread::ThreadPool;

pub use codec::{FrameBuffer, MAX_FRAME_SIZE};
pub use request::{Request, Term};
pub use response::{Response, ResponseKind};
pub use server::EchoServer;
pub use transport::{
    MemoryTransport, PROTOCOL_MAGIC, ProtocolTransport, TcpTransport, Transport, TransportError,
};
