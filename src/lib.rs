//! Client driver that multiplexes many streaming queries over one connection.
//!
//! # Example
//!
//! ```rust,no_run
//! use cryo_driver::{Connection, ConnectionOptions, Term};
//!
//! let options = ConnectionOptions::new("localhost", 28015).with_db("blog");
//! let connection = Connection::connect(&options).unwrap();
//!
//! let cursor = connection.run(Term::new("[1, 2, 3]")).unwrap();
//! for item in cursor {
//!     println!("{}", item.unwrap());
//! }
//! ```
pub mod cli;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod options;
pub mod protocol;
mod table;
pub mod token;
mod utilities;

pub use cli::{Command, prompt};
pub use connection::{Connection, ErrorHandler};
pub use cursor::{Cursor, CursorStatus, Datum};
pub use error::{ConnectionError, FramingError, QueryError, classify};
pub use options::ConnectionOptions;
pub use protocol::{Request, Response, ResponseKind, Term};
pub use table::QueryMode;
pub use token::{Token, TokenAllocator};
