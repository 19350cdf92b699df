//! Error taxonomy for the mapped-file manager.
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation ran after `close()`, or after the manager's last
    /// reservation was released.
    #[error("mapped file is closed")]
    Closed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A map, unmap, sync, resize, lock, or stat syscall failed.
    #[error("{op} failed")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Growing the file under the advisory lock failed.
    #[error("failed to resize file to {target} bytes")]
    ResizeFailed {
        target: u64,
        #[source]
        source: Box<Error>,
    },

    /// `release()` was called more times than `reserve()`.
    #[error("reference count underflow")]
    RefCountUnderflow,

    /// `reserve()` was called on a handle whose count already reached
    /// zero; released handles never come back.
    #[error("reserve on an already-released handle")]
    AfterRelease,
}
