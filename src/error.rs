use std::io;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`KvError`]
pub type Result<T> = std::result::Result<T, KvError>;

/// Error variants surfaced by the store and the servers built on top of it.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum KvError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for reads of a key that is not in the index
    #[error("record does not exist")]
    NotFound,

    /// variant for reads requesting a type different from the stored one
    #[error("incorrect value type")]
    WrongType,

    /// variant for records that failed length validation or decoding
    #[error("corrupt record: {}", .0)]
    Corrupt(String),

    /// variant for operations submitted after the store began shutting down
    #[error("database is closed")]
    Closed,

    /// variant for errors caused during type serialization/deserialization
    #[error("serialization/deserialization error")]
    Serialization(#[from] serde_json::Error),

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for poisoned or otherwise unusable locks
    #[error("{}", .0)]
    Locking(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
