//! Echo server.
//!
//! A small server that speaks the driver protocol and evaluates every term body as JSON text.
//! It exists to exercise the client end to end: arrays are streamed back in fixed-size batches
//! (so clients see `SUCCESS_PARTIAL` and must continue), and a handful of marker values produce
//! each error status on demand.
//!
//! | Term body | Response |
//! |---|---|
//! | array | `batch_size` items per batch, `SUCCESS_PARTIAL` until the last `SUCCESS_STREAM` |
//! | `null` | `SUCCESS_EMPTY` |
//! | `"$db"` | `SUCCESS_JSON` with the term's database name |
//! | `{"$error": kind, "message": m}` | `BROKEN_CLIENT`, `BAD_QUERY` or `RUNTIME_ERROR` |
//! | `{"$status": n}` | raw status `n`, `BAD_QUERY` when `n` is not a `u32` |
//! | any other JSON | `SUCCESS_JSON` echoing it |
//! | not JSON | `BAD_QUERY` |
use std::{
    collections::{HashMap, VecDeque},
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
};

use log::{debug, info, warn};
use serde_json::Value;

use crate::Token;

use super::{
    ProtocolTransport, Request, Response, ResponseKind, Term, ThreadPool, TransportError,
};

const WORKERS: usize = 15;

pub struct EchoServer {
    listener: TcpListener,
    batch_size: usize,
    pool: ThreadPool,
}

impl EchoServer {
    pub fn bind<A: ToSocketAddrs>(address: A, batch_size: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            batch_size: batch_size.max(1),
            pool: ThreadPool::new(WORKERS),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let batch_size = self.batch_size;
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, batch_size) {
                            warn!("connection ended with error: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, batch_size: usize) -> Result<(), TransportError> {
    let mut transport = ProtocolTransport::new(stream);
    transport.read_magic()?;

    let mut session = Session::new(batch_size);
    loop {
        let req = match transport.read_request() {
            Ok(req) => req,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!("received request: {req:?}");

        let resp = session.handle(req);
        transport.write_response(&resp)?;
    }
}

/// Per-connection server state: the batches still owed to each partial query.
struct Session {
    batch_size: usize,
    pending: HashMap<Token, VecDeque<Vec<Value>>>,
}

impl Session {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            pending: HashMap::new(),
        }
    }

    fn handle(&mut self, req: Request) -> Response {
        match req {
            Request::Start { token, term } => self.start(token, &term),
            Request::Continue { token } => match self.pending.remove(&token) {
                Some(batches) => self.next_batch(token, batches),
                None => Response::error(
                    token,
                    ResponseKind::BrokenClient,
                    format!("token {token} has no more batches"),
                    vec![],
                ),
            },
            Request::Stop { token } => {
                self.pending.remove(&token);
                Response::stream(token, Vec::<Value>::new())
            }
        }
    }

    fn start(&mut self, token: Token, term: &Term) -> Response {
        let value: Value = match serde_json::from_slice(term.body()) {
            Ok(value) => value,
            Err(e) => {
                return Response::error(
                    token,
                    ResponseKind::BadQuery,
                    format!("term is not valid JSON: {e}"),
                    vec![String::from("0")],
                );
            }
        };

        match value {
            Value::Null => Response::empty(token),
            Value::Array(items) => {
                let mut batches: VecDeque<Vec<Value>> = items
                    .chunks(self.batch_size)
                    .map(|chunk| chunk.to_vec())
                    .collect();
                if batches.is_empty() {
                    batches.push_back(Vec::new());
                }
                self.next_batch(token, batches)
            }
            Value::String(s) if s == "$db" => Response::atom(
                token,
                term.database().map_or(Value::Null, Value::from),
            ),
            Value::Object(map) if map.contains_key("$error") => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure");
                let kind = match map.get("$error").and_then(Value::as_str) {
                    Some("broken_client") => ResponseKind::BrokenClient,
                    Some("bad_query") => ResponseKind::BadQuery,
                    _ => ResponseKind::RuntimeError,
                };
                Response::error(token, kind, message, vec![String::from("0")])
            }
            Value::Object(map) if map.contains_key("$status") => {
                let status = map
                    .get("$status")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok());
                match status {
                    Some(status) => {
                        let mut resp = Response::empty(token);
                        resp.status = status;
                        resp
                    }
                    None => Response::error(
                        token,
                        ResponseKind::BadQuery,
                        "$status must be an unsigned 32-bit integer",
                        vec![String::from("0")],
                    ),
                }
            }
            other => Response::atom(token, other),
        }
    }

    fn next_batch(&mut self, token: Token, mut batches: VecDeque<Vec<Value>>) -> Response {
        let batch = batches.pop_front().unwrap_or_default();
        if batches.is_empty() {
            Response::stream(token, batch)
        } else {
            self.pending.insert(token, batches);
            Response::partial(token, batch)
        }
    }
}
