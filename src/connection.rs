//! Connection and response dispatch.
//!
//! A [`Connection`] multiplexes any number of concurrent queries over one transport. Each query
//! gets a fresh [`Token`]; the server tags every response with it, and the dispatcher routes the
//! response into that token's cursor.
//!
//! # Overview
//!
//! - [`Connection::run`] allocates a token, records an outstanding entry, sends `START` and hands
//!   back a [`Cursor`] straight away.
//! - [`Connection::on_data`] is fed raw bytes by whoever reads the transport. Complete frames are
//!   decoded and dispatched in arrival order:
//!   - `SUCCESS_PARTIAL`: a `CONTINUE` for the token is written before the batch is handed to
//!     the cursor, which stays active;
//!   - `SUCCESS_STREAM` / `SUCCESS_JSON` / `SUCCESS_EMPTY`: the final batch is delivered and the
//!     entry removed;
//!   - error statuses and unknown statuses: the cursor fails and the entry is removed.
//! - Responses for tokens with no entry (closed cursors, stale tokens) are dropped.
//!
//! # Failure scope
//!
//! Per-query errors only touch their own cursor. A frame that cannot be parsed breaks the
//! connection: the read position is lost, every outstanding cursor fails with
//! [`QueryError::ConnectionLost`] and the error handler runs once.
//!
//! # Locking
//!
//! All connection state sits in one dispatcher behind a mutex shared by every clone of the
//! connection; cursors keep a weak reference to it. The dispatcher lock is taken before any cursor
//! lock, and user callbacks only run after both have been released.
use std::{
    io::Read,
    net::TcpStream,
    sync::{Arc, Mutex, MutexGuard, Weak},
    thread,
};

use log::{debug, error, info, trace, warn};

use crate::{
    ConnectionOptions, Token, TokenAllocator,
    cursor::{Cursor, CursorState, Datum, Delivery, deliver},
    error::{ConnectionError, FramingError, QueryError, classify},
    protocol::{
        FrameBuffer, Request, Response, ResponseKind, TcpTransport, Term, Transport,
        TransportError, codec,
    },
    table::{Entry, OutstandingQueries, QueryMode},
    utilities::lock,
};

pub type ErrorHandler = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Open,
    Broken,
    Closed,
}

/// The single owner of the outstanding-query table and token counter.
pub(crate) struct Dispatcher {
    transport: Box<dyn Transport>,
    tokens: TokenAllocator,
    outstanding: OutstandingQueries,
    frames: FrameBuffer,
    default_db: Option<String>,
    link: LinkState,
    broken_by: Option<String>,
    error_handler: Option<ErrorHandler>,
}

impl Dispatcher {
    fn new(transport: Box<dyn Transport>, options: &ConnectionOptions) -> Self {
        Self {
            transport,
            tokens: TokenAllocator::new(),
            outstanding: OutstandingQueries::default(),
            frames: FrameBuffer::new(options.max_frame_size),
            default_db: options.default_db.clone(),
            link: LinkState::Open,
            broken_by: None,
            error_handler: None,
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match self.link {
            LinkState::Open => Ok(()),
            LinkState::Closed => Err(ConnectionError::Closed),
            LinkState::Broken => Err(self.broken()),
        }
    }

    fn broken(&self) -> ConnectionError {
        ConnectionError::Broken(self.broken_by.clone().unwrap_or_default())
    }

    fn send(&mut self, request: &Request) -> Result<(), ConnectionError> {
        let frame = codec::encode(request)?;
        debug!("sending {} for token {}", request.name(), request.token());
        self.transport.send(&frame)?;
        Ok(())
    }

    fn start(
        &mut self,
        mut term: Term,
        mode: QueryMode,
    ) -> Result<(Token, Arc<Mutex<CursorState>>), ConnectionError> {
        self.ensure_open()?;

        let token = self.tokens.allocate();
        term.resolve_database(self.default_db.as_deref());
        let state = Arc::new(Mutex::new(CursorState::new(token)));
        self.outstanding
            .insert(token, Entry::new(mode, Arc::clone(&state)));

        if let Err(err) = self.send(&Request::Start { token, term }) {
            self.outstanding.remove(token);
            return Err(err);
        }
        Ok((token, state))
    }

    /// Ask the server to cancel `token` and forget it locally.
    pub(crate) fn stop(&mut self, token: Token) -> Result<(), ConnectionError> {
        let result = match self.link {
            LinkState::Open => self.send(&Request::Stop { token }),
            LinkState::Broken | LinkState::Closed => Ok(()),
        };
        self.forget(token);
        result
    }

    fn forget(&mut self, token: Token) -> bool {
        self.outstanding.remove(token).is_some()
    }

    fn fail(&mut self, token: Token, err: QueryError) -> Vec<Delivery> {
        let Some(entry) = self.outstanding.remove(token) else {
            return Vec::new();
        };
        let mut cursor = lock(&entry.state);
        cursor.fail(err)
    }

    fn abort_all(&mut self, reason: &str) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for (token, entry) in self.outstanding.drain() {
            debug!("aborting token {token}: {reason}");
            deliveries.extend(lock(&entry.state).fail(QueryError::ConnectionLost(reason.into())));
        }
        deliveries
    }

    /// Decode and dispatch every complete frame held in the buffer.
    fn drain_frames(&mut self) -> (Vec<Delivery>, Option<FramingError>) {
        let mut deliveries = Vec::new();
        loop {
            let body = match self.frames.next_body() {
                Ok(Some(body)) => body,
                Ok(None) => return (deliveries, None),
                Err(err) => return (deliveries, Some(err)),
            };
            match codec::decode_body::<Response>(&body) {
                Ok(response) => deliveries.extend(self.dispatch(response)),
                Err(err) => return (deliveries, Some(err)),
            }
        }
    }

    fn dispatch(&mut self, response: Response) -> Vec<Delivery> {
        let token = response.token;
        let Some(entry) = self.outstanding.get(token) else {
            debug!(
                "discarding response (status {}) for unknown token {token}",
                response.status
            );
            return Vec::new();
        };
        let state = Arc::clone(&entry.state);
        trace!(
            "response for {:?} token {token}: status {}, {} items",
            entry.mode,
            response.status,
            response.payload.len()
        );

        match response.kind() {
            Ok(ResponseKind::SuccessPartial) => {
                let items = match response.decode_payload() {
                    Ok(items) => items,
                    Err(err) => {
                        if let Err(e) = self.send(&Request::Stop { token }) {
                            warn!("failed to stop token {token}: {e}");
                        }
                        return self.fail(token, err);
                    }
                };
                if let Err(err) = self.send(&Request::Continue { token }) {
                    warn!("failed to continue token {token}: {err}");
                    return self.fail(token, QueryError::ConnectionLost(err.to_string()));
                }
                let mut cursor = lock(&state);
                cursor.push_batch(items, None)
            }
            Ok(
                kind @ (ResponseKind::SuccessStream
                | ResponseKind::SuccessJson
                | ResponseKind::SuccessEmpty),
            ) => {
                self.outstanding.remove(token);
                let mut cursor = lock(&state);
                match final_items(kind, &response) {
                    Ok(items) => cursor.push_batch(items, Some(kind)),
                    Err(err) => cursor.fail(err),
                }
            }
            Ok(ResponseKind::BrokenClient | ResponseKind::BadQuery | ResponseKind::RuntimeError)
            | Err(_) => {
                let err = classify(response.status, response.error_message, response.backtrace);
                self.fail(token, err)
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.link == LinkState::Open {
            if let Err(e) = self.transport.close() {
                warn!("failed to close transport: {e}");
            }
        }
        deliver(self.abort_all("connection dropped"));
    }
}

fn final_items(kind: ResponseKind, response: &Response) -> Result<Vec<Datum>, QueryError> {
    match kind {
        ResponseKind::SuccessEmpty => Ok(Vec::new()),
        ResponseKind::SuccessJson if response.payload.len() != 1 => Err(QueryError::Protocol(
            format!("expected one value, got {}", response.payload.len()),
        )),
        _ => response.decode_payload(),
    }
}

/// A multiplexed connection. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Connection {
    dispatcher: Arc<Mutex<Dispatcher>>,
}

impl Connection {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_options(transport, &ConnectionOptions::default())
    }

    pub fn with_options<T: Transport + 'static>(transport: T, options: &ConnectionOptions) -> Self {
        Self {
            dispatcher: Arc::new(Mutex::new(Dispatcher::new(Box::new(transport), options))),
        }
    }

    /// Open a TCP connection and start a reader thread feeding [`Connection::on_data`].
    pub fn connect(options: &ConnectionOptions) -> Result<Self, ConnectionError> {
        let (transport, reader) = TcpTransport::connect(options.address())?;
        let connection = Self::with_options(transport, options);

        let weak = Arc::downgrade(&connection.dispatcher);
        let buffer_size = options.read_buffer_size.max(1);
        thread::Builder::new()
            .name(String::from("cryo-driver-reader"))
            .spawn(move || read_loop(reader, weak, buffer_size))
            .map_err(TransportError::from)?;

        Ok(connection)
    }

    fn lock(&self) -> MutexGuard<'_, Dispatcher> {
        lock(&self.dispatcher)
    }

    fn cursor(&self, token: Token, state: Arc<Mutex<CursorState>>) -> Cursor {
        Cursor::new(token, state, Arc::downgrade(&self.dispatcher))
    }

    /// Start a query and return its cursor immediately.
    pub fn run(&self, term: Term) -> Result<Cursor, ConnectionError> {
        let (token, state) = self.lock().start(term, QueryMode::Cursor)?;
        Ok(self.cursor(token, state))
    }

    /// Start a query whose whole result goes to `callback`: the value itself for a single-value
    /// response, an array for a stream, `null` for an empty response.
    pub fn run_with<F>(&self, term: Term, callback: F) -> Result<Token, ConnectionError>
    where
        F: FnOnce(Result<Datum, QueryError>) + Send + 'static,
    {
        let (token, state) = self.lock().start(term, QueryMode::SingleShot)?;
        self.cursor(token, state).to_value(callback);
        Ok(token)
    }

    /// Start a query that invokes `on_item` once per result item. The returned cursor can
    /// still be used to close the query early.
    pub fn iter<F>(&self, term: Term, on_item: F) -> Result<Cursor, ConnectionError>
    where
        F: FnMut(Result<Datum, QueryError>) + Send + 'static,
    {
        let (token, state) = self.lock().start(term, QueryMode::PerItem)?;
        let cursor = self.cursor(token, state);
        cursor.each(on_item);
        Ok(cursor)
    }

    /// Set the database used by terms that do not name one. Local only.
    pub fn use_db(&self, database: impl Into<String>) {
        let database = database.into();
        debug!("default database is now '{database}'");
        self.lock().default_db = Some(database);
    }

    pub fn default_db(&self) -> Option<String> {
        self.lock().default_db.clone()
    }

    /// Feed bytes read from the transport. Bytes may split or join frames arbitrarily.
    pub fn on_data(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let (deliveries, failure) = {
            let mut dispatcher = self.lock();
            if dispatcher.link == LinkState::Broken {
                return Err(dispatcher.broken());
            }
            dispatcher.frames.extend(bytes);
            dispatcher.drain_frames()
        };

        deliver(deliveries);
        match failure {
            Some(err) => Err(self.break_link(err)),
            None => Ok(()),
        }
    }

    /// Feed exactly one frame, for transports that preserve frame boundaries.
    pub fn on_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        let decoded = {
            let mut dispatcher = self.lock();
            if dispatcher.link == LinkState::Broken {
                return Err(dispatcher.broken());
            }
            match codec::decode::<Response>(frame) {
                Ok(response) => Ok(dispatcher.dispatch(response)),
                Err(err) => Err(err),
            }
        };

        match decoded {
            Ok(deliveries) => {
                deliver(deliveries);
                Ok(())
            }
            Err(err) => Err(self.break_link(err)),
        }
    }

    fn break_link(&self, err: FramingError) -> ConnectionError {
        error!("unreadable frame, giving up on connection: {err}");

        let (deliveries, handler) = {
            let mut dispatcher = self.lock();
            dispatcher.link = LinkState::Broken;
            dispatcher.broken_by = Some(err.to_string());
            if let Err(e) = dispatcher.transport.close() {
                warn!("failed to close transport: {e}");
            }
            (dispatcher.abort_all(&err.to_string()), dispatcher.error_handler.clone())
        };

        deliver(deliveries);
        let err = ConnectionError::Framing(err);
        if let Some(handler) = handler {
            handler(&err);
        }
        err
    }

    /// The transport went away; nothing more will arrive for any outstanding query.
    fn on_disconnect(&self, reason: &str) {
        let deliveries = {
            let mut dispatcher = self.lock();
            if dispatcher.link == LinkState::Open {
                info!("connection lost: {reason}");
            }
            dispatcher.abort_all(reason)
        };
        deliver(deliveries);
    }

    /// Drop the entry for `token` without notifying its cursor. Returns whether an entry existed.
    pub fn forget_token(&self, token: Token) -> bool {
        self.lock().forget(token)
    }

    /// Number of queries still waiting on the server.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Register the handler for connection-fatal errors.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.lock().error_handler = Some(Arc::new(handler));
    }

    pub fn is_open(&self) -> bool {
        self.lock().link == LinkState::Open
    }

    /// Close the transport. Outstanding queries are not stopped server-side.
    pub fn close(&self) -> Result<(), ConnectionError> {
        let mut dispatcher = self.lock();
        if dispatcher.link == LinkState::Closed {
            return Ok(());
        }

        info!(
            "closing connection with {} outstanding queries",
            dispatcher.outstanding.len()
        );
        dispatcher.link = LinkState::Closed;
        dispatcher.transport.close()?;
        Ok(())
    }
}

fn read_loop(mut reader: TcpStream, dispatcher: Weak<Mutex<Dispatcher>>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = reader.read(&mut buf);
        let Some(dispatcher) = dispatcher.upgrade() else {
            return;
        };
        let connection = Connection { dispatcher };

        match read {
            Ok(0) => {
                connection.on_disconnect("server closed the connection");
                return;
            }
            Ok(n) => {
                if connection.on_data(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) => {
                connection.on_disconnect(&e.to_string());
                return;
            }
        }
    }
}
