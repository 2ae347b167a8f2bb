//! Streaming query results.
//!
//! A [`Cursor`] is the caller's handle on one token. The connection pushes batches into the
//! cursor's shared [`CursorState`] as responses arrive; the caller pulls them out lazily
//! ([`Cursor::next_with`]), has them pushed per item ([`Cursor::each`]), or waits for the whole
//! remainder ([`Cursor::to_array`]).
//!
//! # Overview
//!
//! A cursor starts `Active` and ends in exactly one of `Exhausted`, `Errored` or `Closed`.
//! Consumers that cannot be satisfied yet are queued as waiters and served in registration order
//! whenever a batch or a terminal transition arrives. Serving a waiter never calls user code
//! directly: it produces a deferred delivery that the caller of the transition runs once every
//! lock has been released, so callbacks are free to call back into the cursor or the connection.
//!
//! # Blocking use
//!
//! `Cursor` also implements [`Iterator`] and offers [`Cursor::collect_all`]. Both park the current
//! thread until the callback fires, so they are only usable when another thread (such as the
//! reader spawned by [`Connection::connect`](crate::Connection::connect)) feeds the connection.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak, mpsc},
};

use log::{debug, trace};
use serde_json::Value;

use crate::{
    Token,
    connection::Dispatcher,
    error::{ConnectionError, QueryError},
    protocol::ResponseKind,
    utilities::lock,
};

/// One result item.
pub type Datum = Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStatus {
    /// More batches may arrive.
    Active,
    /// The final batch has been received.
    Exhausted,
    /// A terminal error has been received.
    Errored(QueryError),
    /// The caller closed the cursor.
    Closed,
}

impl CursorStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CursorStatus::Active)
    }
}

pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

pub(crate) fn deliver(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        delivery();
    }
}

type NextCallback = Box<dyn FnOnce(Result<Option<Datum>, QueryError>) + Send>;
type ItemCallback = Arc<Mutex<dyn FnMut(Result<Datum, QueryError>) + Send>>;
type DoneCallback = Box<dyn FnOnce() + Send>;
type ArrayCallback = Box<dyn FnOnce(Result<Vec<Datum>, QueryError>) + Send>;
type ValueCallback = Box<dyn FnOnce(Result<Datum, QueryError>) + Send>;

enum Waiter {
    Next(NextCallback),
    Each {
        on_item: ItemCallback,
        on_done: Option<DoneCallback>,
    },
    Array(ArrayCallback),
    Single(ValueCallback),
}

/// Per-query state shared by the outstanding-query entry and the caller's cursor.
pub(crate) struct CursorState {
    token: Token,
    status: CursorStatus,
    buffer: VecDeque<Datum>,
    waiters: VecDeque<Waiter>,
    batches: usize,
    terminal: Option<ResponseKind>,
}

impl CursorState {
    pub(crate) fn new(token: Token) -> Self {
        Self {
            token,
            status: CursorStatus::Active,
            buffer: VecDeque::new(),
            waiters: VecDeque::new(),
            batches: 0,
            terminal: None,
        }
    }

    pub(crate) fn status(&self) -> &CursorStatus {
        &self.status
    }

    fn is_active(&self) -> bool {
        self.status == CursorStatus::Active
    }

    /// Append a batch. `terminal` carries the final status when this batch ends the stream.
    pub(crate) fn push_batch(
        &mut self,
        items: Vec<Datum>,
        terminal: Option<ResponseKind>,
    ) -> Vec<Delivery> {
        if !self.is_active() {
            trace!("dropping batch for finished cursor {}", self.token);
            return Vec::new();
        }

        self.batches += 1;
        trace!(
            "cursor {} batch {} carries {} items",
            self.token,
            self.batches,
            items.len()
        );
        self.buffer.extend(items);

        if let Some(kind) = terminal {
            self.status = CursorStatus::Exhausted;
            self.terminal = Some(kind);
        }
        self.drain()
    }

    pub(crate) fn fail(&mut self, err: QueryError) -> Vec<Delivery> {
        if !self.is_active() {
            return Vec::new();
        }

        debug!("cursor {} failed: {err}", self.token);
        self.status = CursorStatus::Errored(err);
        self.drain()
    }

    /// Move to `Closed`, discarding buffered items. `None` if the cursor had already finished.
    pub(crate) fn close(&mut self) -> Option<Vec<Delivery>> {
        if !self.is_active() {
            return None;
        }

        self.status = CursorStatus::Closed;
        self.buffer.clear();
        Some(self.drain())
    }

    fn register(&mut self, waiter: Waiter) -> Vec<Delivery> {
        self.waiters.push_back(waiter);
        self.drain()
    }

    /// Serve queued waiters, oldest first, until one has to wait for more data.
    fn drain(&mut self) -> Vec<Delivery> {
        let mut out: Vec<Delivery> = Vec::new();

        while let Some(waiter) = self.waiters.pop_front() {
            match waiter {
                Waiter::Next(cb) => {
                    if let Some(item) = self.buffer.pop_front() {
                        out.push(Box::new(move || cb(Ok(Some(item)))));
                        continue;
                    }

                    match &self.status {
                        CursorStatus::Active => {
                            self.waiters.push_front(Waiter::Next(cb));
                            break;
                        }
                        CursorStatus::Exhausted | CursorStatus::Closed => {
                            out.push(Box::new(move || cb(Ok(None))))
                        }
                        CursorStatus::Errored(err) => {
                            let err = err.clone();
                            out.push(Box::new(move || cb(Err(err))));
                        }
                    }
                }
                Waiter::Each { on_item, on_done } => {
                    let items: Vec<Datum> = self.buffer.drain(..).collect();
                    if !items.is_empty() {
                        let f = Arc::clone(&on_item);
                        out.push(Box::new(move || {
                            let mut f = lock(&f);
                            for item in items {
                                (&mut *f)(Ok(item));
                            }
                        }));
                    }

                    match &self.status {
                        CursorStatus::Active => {
                            self.waiters.push_front(Waiter::Each { on_item, on_done });
                            break;
                        }
                        CursorStatus::Exhausted | CursorStatus::Closed => {
                            if let Some(done) = on_done {
                                out.push(done);
                            }
                        }
                        CursorStatus::Errored(err) => {
                            let err = err.clone();
                            out.push(Box::new(move || {
                                let mut f = lock(&on_item);
                                (&mut *f)(Err(err));
                            }));
                        }
                    }
                }
                Waiter::Array(cb) => match &self.status {
                    CursorStatus::Active => {
                        self.waiters.push_front(Waiter::Array(cb));
                        break;
                    }
                    CursorStatus::Exhausted | CursorStatus::Closed => {
                        let items: Vec<Datum> = self.buffer.drain(..).collect();
                        out.push(Box::new(move || cb(Ok(items))));
                    }
                    CursorStatus::Errored(err) => {
                        let err = err.clone();
                        out.push(Box::new(move || cb(Err(err))));
                    }
                },
                Waiter::Single(cb) => match &self.status {
                    CursorStatus::Active => {
                        self.waiters.push_front(Waiter::Single(cb));
                        break;
                    }
                    CursorStatus::Exhausted | CursorStatus::Closed => {
                        let mut items: Vec<Datum> = self.buffer.drain(..).collect();
                        let value = match (self.terminal, items.len()) {
                            (Some(ResponseKind::SuccessJson), 1) => items.pop().unwrap_or_default(),
                            (Some(ResponseKind::SuccessEmpty), 0) | (None, 0) => Value::Null,
                            _ => Value::Array(items),
                        };
                        out.push(Box::new(move || cb(Ok(value))));
                    }
                    CursorStatus::Errored(err) => {
                        let err = err.clone();
                        out.push(Box::new(move || cb(Err(err))));
                    }
                },
            }
        }
        out
    }
}

/// Caller-facing handle on a streaming query result.
pub struct Cursor {
    token: Token,
    state: Arc<Mutex<CursorState>>,
    link: Weak<Mutex<Dispatcher>>,
    fused: bool,
}

impl Cursor {
    pub(crate) fn new(
        token: Token,
        state: Arc<Mutex<CursorState>>,
        link: Weak<Mutex<Dispatcher>>,
    ) -> Self {
        Self {
            token,
            state,
            link,
            fused: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn status(&self) -> CursorStatus {
        lock(&self.state).status().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Items received but not yet handed to a consumer.
    pub fn buffered(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// Deliver the next item, or `Ok(None)` once the stream has ended.
    ///
    /// Fires immediately when an item is buffered or the cursor has finished; otherwise the
    /// callback is queued until the next batch arrives. Items buffered before an error are
    /// still delivered ahead of it.
    pub fn next_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<Option<Datum>, QueryError>) + Send + 'static,
    {
        self.register(Waiter::Next(Box::new(callback)));
    }

    /// Invoke `on_item` for every remaining item in arrival order. An error is passed as the
    /// final invocation.
    pub fn each<F>(&self, on_item: F)
    where
        F: FnMut(Result<Datum, QueryError>) + Send + 'static,
    {
        let on_item: ItemCallback = Arc::new(Mutex::new(on_item));
        self.register(Waiter::Each {
            on_item,
            on_done: None,
        });
    }

    /// Like [`Cursor::each`], also invoking `on_done` once the stream is exhausted.
    pub fn each_then<F, D>(&self, on_item: F, on_done: D)
    where
        F: FnMut(Result<Datum, QueryError>) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        let on_item: ItemCallback = Arc::new(Mutex::new(on_item));
        self.register(Waiter::Each {
            on_item,
            on_done: Some(Box::new(on_done)),
        });
    }

    /// Deliver every item not yet consumed, once the stream is exhausted.
    pub fn to_array<F>(&self, callback: F)
    where
        F: FnOnce(Result<Vec<Datum>, QueryError>) + Send + 'static,
    {
        self.register(Waiter::Array(Box::new(callback)));
    }

    pub(crate) fn to_value<F>(&self, callback: F)
    where
        F: FnOnce(Result<Datum, QueryError>) + Send + 'static,
    {
        self.register(Waiter::Single(Box::new(callback)));
    }

    /// Cancel the query.
    ///
    /// Sends `STOP` and forgets the token without waiting for the server, so responses still
    /// in flight are discarded. Closing a finished cursor does nothing.
    pub fn close(&self) -> Result<(), ConnectionError> {
        let Some(deliveries) = lock(&self.state).close() else {
            return Ok(());
        };

        let result = match self.link.upgrade() {
            Some(link) => {
                let mut dispatcher = lock(&link);
                dispatcher.stop(self.token)
            }
            None => Ok(()),
        };
        deliver(deliveries);
        result
    }

    /// [`Cursor::close`], then hand the outcome to `callback`.
    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), ConnectionError>),
    {
        callback(self.close());
    }

    /// Block until the stream ends and return every remaining item.
    pub fn collect_all(&self) -> Result<Vec<Datum>, QueryError> {
        let (tx, rx) = mpsc::channel();
        self.to_array(move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or_else(|_| Err(detached()))
    }

    fn register(&self, waiter: Waiter) {
        let deliveries = lock(&self.state).register(waiter);
        deliver(deliveries);
    }
}

fn detached() -> QueryError {
    QueryError::ConnectionLost(String::from("cursor detached from its connection"))
}

impl Iterator for Cursor {
    type Item = Result<Datum, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }

        let (tx, rx) = mpsc::channel();
        self.next_with(move |result| {
            let _ = tx.send(result);
        });

        match rx.recv().unwrap_or_else(|_| Err(detached())) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.fused = true;
                None
            }
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("token", &self.token)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    type Seen<T> = Arc<Mutex<Vec<T>>>;

    fn cursor() -> Cursor {
        let token = Token::new(1);
        Cursor::new(
            token,
            Arc::new(Mutex::new(CursorState::new(token))),
            Weak::new(),
        )
    }

    fn push(cursor: &Cursor, items: Vec<Datum>, terminal: Option<ResponseKind>) {
        let deliveries = lock(&cursor.state).push_batch(items, terminal);
        deliver(deliveries);
    }

    fn fail(cursor: &Cursor, err: QueryError) {
        let deliveries = lock(&cursor.state).fail(err);
        deliver(deliveries);
    }

    fn record_next(cursor: &Cursor, seen: &Seen<Result<Option<Datum>, QueryError>>) {
        let seen = Arc::clone(seen);
        cursor.next_with(move |r| seen.lock().unwrap().push(r));
    }

    fn runtime(message: &str) -> QueryError {
        QueryError::Runtime {
            message: message.into(),
            backtrace: vec![],
        }
    }

    #[test]
    fn next_serves_buffer_then_waits() {
        let cursor = cursor();
        let seen: Seen<_> = Arc::default();
        push(&cursor, vec![json!(1), json!(2)], None);

        record_next(&cursor, &seen);
        record_next(&cursor, &seen);
        record_next(&cursor, &seen);
        assert_eq!(seen.lock().unwrap().len(), 2);

        push(&cursor, vec![json!(3)], Some(ResponseKind::SuccessStream));
        record_next(&cursor, &seen);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(Some(json!(1))), Ok(Some(json!(2))), Ok(Some(json!(3))), Ok(None)]
        );
        assert_eq!(cursor.status(), CursorStatus::Exhausted);
    }

    #[test]
    fn buffered_items_precede_error() {
        let cursor = cursor();
        let seen: Seen<_> = Arc::default();
        push(&cursor, vec![json!("a")], None);
        fail(&cursor, runtime("boom"));

        record_next(&cursor, &seen);
        record_next(&cursor, &seen);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(Some(json!("a"))), Err(runtime("boom"))]
        );
    }

    #[test]
    fn to_array_returns_unconsumed_items() {
        let cursor = cursor();
        let seen: Seen<_> = Arc::default();
        let array: Seen<_> = Arc::default();

        push(&cursor, vec![json!(1), json!(2), json!(3)], None);
        record_next(&cursor, &seen);

        let sink = Arc::clone(&array);
        cursor.to_array(move |r| sink.lock().unwrap().push(r));
        assert!(array.lock().unwrap().is_empty());

        push(&cursor, vec![json!(4)], Some(ResponseKind::SuccessStream));
        assert_eq!(
            *array.lock().unwrap(),
            vec![Ok(vec![json!(2), json!(3), json!(4)])]
        );
    }

    #[test]
    fn each_streams_until_done() {
        let cursor = cursor();
        let items: Seen<_> = Arc::default();
        let done = Arc::new(Mutex::new(false));

        push(&cursor, vec![json!(1)], None);
        let sink = Arc::clone(&items);
        let flag = Arc::clone(&done);
        cursor.each_then(
            move |r| sink.lock().unwrap().push(r),
            move || *flag.lock().unwrap() = true,
        );
        assert_eq!(items.lock().unwrap().len(), 1);
        assert!(!*done.lock().unwrap());

        push(&cursor, vec![json!(2), json!(3)], Some(ResponseKind::SuccessStream));
        assert_eq!(
            *items.lock().unwrap(),
            vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]
        );
        assert!(*done.lock().unwrap());
    }

    #[test]
    fn each_receives_error_last() {
        let cursor = cursor();
        let items: Seen<_> = Arc::default();
        let sink = Arc::clone(&items);
        cursor.each(move |r| sink.lock().unwrap().push(r));

        push(&cursor, vec![json!(1)], None);
        fail(&cursor, runtime("late"));
        push(&cursor, vec![json!(2)], None);

        assert_eq!(*items.lock().unwrap(), vec![Ok(json!(1)), Err(runtime("late"))]);
    }

    #[test]
    fn close_ends_pending_consumers() {
        let cursor = cursor();
        let seen: Seen<_> = Arc::default();
        push(&cursor, vec![json!(1)], None);
        record_next(&cursor, &seen);
        record_next(&cursor, &seen);

        cursor.close().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(Some(json!(1))), Ok(None)]
        );
        assert_eq!(cursor.status(), CursorStatus::Closed);

        // Later batches and repeated closes change nothing.
        push(&cursor, vec![json!(2)], Some(ResponseKind::SuccessStream));
        cursor.close().unwrap();
        assert_eq!(cursor.status(), CursorStatus::Closed);
        assert_eq!(cursor.buffered(), 0);
    }

    #[test]
    fn terminal_state_is_final() {
        let cursor = cursor();
        push(&cursor, vec![], Some(ResponseKind::SuccessEmpty));
        fail(&cursor, runtime("too late"));
        cursor.close().unwrap();

        assert_eq!(cursor.status(), CursorStatus::Exhausted);
    }

    #[test]
    fn single_value_shapes() {
        let cases = vec![
            (vec![json!({"n": 1})], ResponseKind::SuccessJson, json!({"n": 1})),
            (vec![], ResponseKind::SuccessEmpty, Value::Null),
            (vec![json!(1), json!(2)], ResponseKind::SuccessStream, json!([1, 2])),
            (vec![], ResponseKind::SuccessStream, json!([])),
        ];

        for (items, kind, expected) in cases {
            let cursor = cursor();
            let seen: Seen<_> = Arc::default();
            let sink = Arc::clone(&seen);
            cursor.to_value(move |r| sink.lock().unwrap().push(r));
            push(&cursor, items, Some(kind));

            assert_eq!(*seen.lock().unwrap(), vec![Ok(expected)]);
        }
    }

    #[test]
    fn callbacks_may_reenter_cursor() {
        let cursor = Arc::new(cursor());
        let seen: Seen<_> = Arc::default();

        let inner = Arc::clone(&cursor);
        let sink = Arc::clone(&seen);
        cursor.next_with(move |first| {
            sink.lock().unwrap().push(first);
            let sink = Arc::clone(&sink);
            inner.next_with(move |second| sink.lock().unwrap().push(second));
        });

        push(&cursor, vec![json!(1), json!(2)], None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(Some(json!(1))), Ok(Some(json!(2)))]
        );
    }

    #[test]
    fn iterator_over_finished_cursor() {
        let cursor = cursor();
        push(&cursor, vec![json!(1), json!(2)], Some(ResponseKind::SuccessStream));

        let items: Vec<_> = cursor.collect();
        assert_eq!(items, vec![Ok(json!(1)), Ok(json!(2))]);
    }

    #[test]
    fn iterator_stops_after_error() {
        let mut cursor = cursor();
        fail(&cursor, runtime("x"));

        assert_eq!(cursor.next(), Some(Err(runtime("x"))));
        assert_eq!(cursor.next(), None);
    }
}
