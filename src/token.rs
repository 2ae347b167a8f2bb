//! Query correlation tokens.
//!
//! Every query started on a [`Connection`](crate::Connection) is tagged with a [`Token`]. The
//! server echoes the token on every response, which is how the connection routes batches back
//! to the right cursor while many queries share one socket.
use std::fmt;

use bincode::{Decode, Encode};

/// Connection-scoped query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct Token(u64);

impl Token {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues strictly increasing tokens, starting at 1.
///
/// One allocator belongs to exactly one connection; tokens are only unique among the
/// queries of the connection that issued them.
#[derive(Debug)]
pub struct TokenAllocator {
    next: u64,
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next token. Only called when a query starts, never for
    /// continuations or stops.
    pub fn allocate(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }

    /// Number of tokens issued so far.
    pub fn issued(&self) -> u64 {
        self.next - 1
    }
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_is_one() {
        let mut tokens = TokenAllocator::new();
        assert_eq!(tokens.allocate(), Token::new(1));
        assert_eq!(tokens.issued(), 1);
    }

    #[test]
    fn tokens_strictly_increase() {
        let mut tokens = TokenAllocator::default();
        let issued: Vec<Token> = (0..100).map(|_| tokens.allocate()).collect();

        for pair in issued.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[1].value(), pair[0].value() + 1);
        }
    }

    #[test]
    fn allocators_are_independent() {
        let mut a = TokenAllocator::new();
        let mut b = TokenAllocator::new();
        a.allocate();
        a.allocate();

        assert_eq!(b.allocate(), Token::new(1));
        assert_eq!(a.allocate(), Token::new(3));
    }

    #[test]
    fn token_display() {
        assert_eq!(Token::new(42).to_string(), "#42");
    }
}
