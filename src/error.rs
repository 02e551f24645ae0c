//! Error surface of the runtime.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the coroutine runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The handle does not name an open resource: it was never issued, or it
    /// has already been closed.
    #[error("invalid handle")]
    InvalidHandle,

    /// A runtime-managed stack allocation failed. The launch had no effect.
    #[error("out of memory allocating coroutine stack")]
    OutOfMemory,

    /// No free slot left in the handle table. The launch had no effect.
    #[error("handle space exhausted")]
    ResourceExhausted,

    /// A blocking call was cut short because the coroutine is being closed.
    ///
    /// Delivered only inside the affected coroutine's own control flow;
    /// `close` itself never reports it.
    #[error("canceled")]
    Canceled,
}
