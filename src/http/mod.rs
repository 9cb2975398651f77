//! C9: the HTTP/streaming side of the query stack.

pub mod reader;
pub mod retryable;

pub use reader::{ByteStream, RowStream, Rows};
pub use retryable::is_retryable;
