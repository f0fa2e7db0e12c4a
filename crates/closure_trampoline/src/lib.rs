#![deny(missing_docs)]
#![cfg_attr(doc_cfg, feature(doc_cfg))]

//! Plain C function pointers backed by capturing closures.
//!
//! C callback APIs only accept a bare function pointer, with no room for the environment a Rust
//! closure carries. A [`Trampoline`] bridges the two: it owns the closure and emits a few bytes of
//! machine code into an executable [`ExecPool`] slot which inserts a pointer to the closure in
//! front of the caller's arguments and forwards the call. The address of that code is a regular
//! `extern "C" fn` that can be handed to foreign code.
//!
//! Signatures with fewer than six integer parameters only need their argument registers shifted
//! before a tail jump. Longer ones push the last integer register out onto the stack, so the
//! trampoline relocates the caller's stack arguments and calls the closure as a subroutine.
//!
//! ## Quick start
//! ```
//! use closure_trampoline::Trampoline;
//!
//! let base = 100;
//! let sum: Trampoline<extern "C" fn(i32, i32, i32, i32, i32, i32, i32, i32) -> i32> =
//!     Trampoline::new(move |a: i32, b: i32, c: i32, d: i32, e: i32, f: i32, g: i32, h: i32| {
//!         base + a + b + c + d + e + f + g + h
//!     })?;
//!
//! let f = sum.get();
//! assert_eq!(f(1, 2, 3, 4, 5, 6, 7, 8), 136);
//! # Ok::<(), closure_trampoline::Error>(())
//! ```

/// Calling convention classification of signatures.
pub mod classify;
mod codegen;
mod error;
mod pool;
mod signature;
mod trampoline;

pub use classify::{Layout, Strategy};
pub use error::{Error, Result};
pub use pool::{system_page_size, ExecPool, PoolConfig, PoolStats, Slot};
pub use signature::{Bind, Param, ParamClass, ReturnValue, Signature};
pub use trampoline::Trampoline;
