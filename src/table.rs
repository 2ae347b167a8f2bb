//! Outstanding-query table.
//!
//! Maps each in-flight [`Token`] to the state its responses feed. An entry exists from the moment
//! a query starts until a terminal response arrives, an error arrives, or the caller closes the
//! cursor; a response whose token has no entry is stale and gets dropped by the dispatcher.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{Token, cursor::CursorState};

/// How the caller consumes a query's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// A [`Cursor`](crate::Cursor) handed back to the caller.
    Cursor,
    /// One callback with the whole result.
    SingleShot,
    /// One callback per result item.
    PerItem,
}

pub(crate) struct Entry {
    pub(crate) mode: QueryMode,
    pub(crate) state: Arc<Mutex<CursorState>>,
}

impl Entry {
    pub(crate) fn new(mode: QueryMode, state: Arc<Mutex<CursorState>>) -> Self {
        Self { mode, state }
    }
}

#[derive(Default)]
pub(crate) struct OutstandingQueries {
    entries: HashMap<Token, Entry>,
}

impl OutstandingQueries {
    pub(crate) fn insert(&mut self, token: Token, entry: Entry) {
        let previous = self.entries.insert(token, entry);
        debug_assert!(previous.is_none(), "token {token} issued twice");
    }

    pub(crate) fn get(&self, token: Token) -> Option<&Entry> {
        self.entries.get(&token)
    }

    pub(crate) fn remove(&mut self, token: Token) -> Option<Entry> {
        self.entries.remove(&token)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry, in token order.
    pub(crate) fn drain(&mut self) -> Vec<(Token, Entry)> {
        let mut entries: Vec<_> = self.entries.drain().collect();
        entries.sort_by_key(|(token, _)| *token);
        entries
    }
}
