use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info};
use thiserror::Error;

use crate::{error::FramingError, utilities::lock};

use super::{
    Request, Response,
    codec::{self, LENGTH_PREFIX, MAX_FRAME_SIZE},
};

/// Sent once by a client right after the socket connects.
pub const PROTOCOL_MAGIC: u32 = 0x3f61_ba36;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("unexpected handshake magic {0:#010x}")]
    Handshake(u32),
    #[error("transport is closed")]
    Closed,
}

/// Outbound half of a byte-stream transport.
///
/// Inbound bytes are pushed into the connection by whoever owns the read side (see
/// [`Connection::on_data`](crate::Connection::on_data)); the transport only writes.
pub trait Transport: Send {
    /// Write one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// TCP transport. [`TcpTransport::connect`] also returns a clone of the socket for the
/// reader side.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<(Self, TcpStream), TransportError> {
        let mut stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        stream.write_all(&PROTOCOL_MAGIC.to_le_bytes())?;
        stream.flush()?;
        info!("connected to {}", stream.peer_addr()?);

        let reader = stream.try_clone()?;
        Ok((Self { stream }, reader))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// In-memory transport that records every outbound frame.
///
/// Clones share the same record, so a test can hand one clone to a
/// [`Connection`](crate::Connection) and inspect the traffic through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    /// Outbound frames decoded back into requests, in send order.
    pub fn requests(&self) -> Result<Vec<Request>, FramingError> {
        lock(&self.sent).iter().map(|f| codec::decode(f)).collect()
    }

    pub fn clear(&self) {
        lock(&self.sent).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        lock(&self.sent).push(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Blocking frame reader/writer over any bidirectional stream. Used by the server side,
/// which handles one request at a time per connection.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    limit: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            limit: MAX_FRAME_SIZE,
        }
    }

    pub fn write_magic(&mut self) -> Result<(), TransportError> {
        self.stream.write_all(&PROTOCOL_MAGIC.to_le_bytes())?;
        Ok(())
    }

    pub fn read_magic(&mut self) -> Result<(), TransportError> {
        let mut magic = [0u8; 4];
        self.stream.read_exact(&mut magic)?;

        match u32::from_le_bytes(magic) {
            PROTOCOL_MAGIC => Ok(()),
            other => Err(TransportError::Handshake(other)),
        }
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        self.write_frame(&codec::encode(req)?)
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        self.write_frame(&codec::encode(resp)?)
    }

    pub fn read_request(&mut self) -> Result<Request, TransportError> {
        let body = self.read_body()?;
        Ok(codec::decode_body(&body)?)
    }

    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        let body = self.read_body()?;
        Ok(codec::decode_body(&body)?)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_body(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; LENGTH_PREFIX];
        self.stream.read_exact(&mut header)?;

        let len = u32::from_le_bytes(header) as usize;
        if len > self.limit {
            return Err(FramingError::TooLarge {
                size: len,
                limit: self.limit,
            }
            .into());
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        debug!("read frame of {len} bytes");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;
    use crate::{Token, protocol::Term};

    #[test]
    fn read_write_request() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let req = Request::Start {
            token: Token::new(1),
            term: Term::new("[]"),
        };

        transport.write_request(&req).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_request().unwrap(), req);
    }

    #[test]
    fn read_write_response() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let resp = Response::empty(Token::new(4));

        transport.write_response(&resp).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_response().unwrap(), resp);
    }

    #[test]
    fn handshake_magic() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        transport.write_magic().unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        transport.read_magic().unwrap();

        let mut transport = ProtocolTransport::new(Cursor::new(vec![1, 2, 3, 4]));
        assert!(matches!(
            transport.read_magic(),
            Err(TransportError::Handshake(0x0403_0201))
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut bytes = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        assert!(matches!(
            transport.read_request(),
            Err(TransportError::Framing(FramingError::TooLarge { .. }))
        ));
    }

    #[test]
    fn memory_transport_records_requests() {
        let transport = MemoryTransport::new();
        let mut sender = transport.clone();

        sender
            .send(&codec::encode(&Request::Stop { token: Token::new(2) }).unwrap())
            .unwrap();
        assert_eq!(
            transport.requests().unwrap(),
            vec![Request::Stop { token: Token::new(2) }]
        );

        sender.close().unwrap();
        assert!(transport.is_closed());
        assert!(matches!(sender.send(&[]), Err(TransportError::Closed)));
    }
}
