use dynasmrt::DynasmError;

use std::io;

/// Errors produced while provisioning executable memory or emitting a trampoline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operating system refused to map an executable page.
    ///
    /// Without executable memory no trampoline can be produced, so callers should treat this as
    /// fatal.
    #[error("failed to map {size} bytes of executable memory")]
    Map {
        /// Requested mapping size in bytes.
        size: usize,
        /// Error reported by `mmap`.
        #[source]
        source: io::Error,
    },

    /// The pool already holds its configured maximum number of pages and every slot is in use.
    #[error("executable memory pool exhausted after {pages} pages")]
    Exhausted {
        /// Number of pages mapped when the request failed.
        pages: usize,
    },

    /// A [`PoolConfig`](crate::PoolConfig) was rejected.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    /// The generated code does not fit into a single slot.
    #[error("generated trampoline is {len} bytes but slots hold {capacity}")]
    CodeTooLarge {
        /// Length of the emitted machine code.
        len: usize,
        /// Slot size of the pool.
        capacity: usize,
    },

    /// The assembler could not resolve the emitted code.
    #[error("assembler error: {0:?}")]
    Assemble(DynasmError),
}

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
