use bincode::{Decode, Encode};

use crate::Token;

/// A compiled query, opaque to the driver.
///
/// The body is whatever the query compiler produced; the driver only forwards it. `database`
/// is the database the query runs against, filled from the connection default when the
/// compiler left it unset.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Term {
    body: Vec<u8>,
    database: Option<String>,
}

impl Term {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            database: None,
        }
    }

    /// Pin the term to a database, overriding the connection default.
    pub fn on_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub(crate) fn resolve_database(&mut self, default: Option<&str>) {
        if self.database.is_none() {
            self.database = default.map(String::from);
        }
    }
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Request {
    /// Begin a new query.
    Start { token: Token, term: Term },
    /// Ask for the next batch of a query left in partial state.
    Continue { token: Token },
    /// Cancel a query server-side.
    Stop { token: Token },
}

impl Request {
    pub fn token(&self) -> Token {
        match self {
            Request::Start { token, .. } | Request::Continue { token } | Request::Stop { token } => {
                *token
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Start { .. } => "START",
            Request::Continue { .. } => "CONTINUE",
            Request::Stop { .. } => "STOP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_token() {
        let start = Request::Start {
            token: Token::new(3),
            term: Term::new("1"),
        };
        assert_eq!(start.token(), Token::new(3));
        assert_eq!(start.name(), "START");
        assert_eq!(Request::Stop { token: Token::new(9) }.token(), Token::new(9));
    }

    #[test]
    fn default_database_fills_missing() {
        let mut term = Term::new("1");
        term.resolve_database(Some("blog"));
        assert_eq!(term.database(), Some("blog"));
    }

    #[test]
    fn explicit_database_wins() {
        let mut term = Term::new("1").on_database("audit");
        term.resolve_database(Some("blog"));
        assert_eq!(term.database(), Some("audit"));

        let mut term = Term::new("1");
        term.resolve_database(None);
        assert_eq!(term.database(), None);
    }
}
