use crate::{
    classify::Layout,
    codegen,
    error::Result,
    pool::{ExecPool, Slot},
    signature::{Bind, Signature},
};

use tracing::trace;

use std::{fmt, ptr::NonNull};

/// A heap allocated callable with its concrete type erased.
///
/// Only the address of the allocation, the matching dispatch routine and a way to destroy it are
/// kept.
struct ErasedCallable {
    data: NonNull<()>,
    dispatch: *const u8,
    drop_fn: unsafe fn(NonNull<()>),
}

impl ErasedCallable {
    fn new<S: Bind<F>, F>(callable: F) -> Self {
        unsafe fn drop_boxed<F>(data: NonNull<()>) {
            drop(unsafe { Box::from_raw(data.cast::<F>().as_ptr()) });
        }

        let data = NonNull::from(Box::leak(Box::new(callable))).cast::<()>();

        Self {
            data,
            dispatch: S::dispatcher(),
            drop_fn: drop_boxed::<F>,
        }
    }
}

impl Drop for ErasedCallable {
    fn drop(&mut self) {
        unsafe { (self.drop_fn)(self.data) }
    }
}

/// A closure exposed as a plain `extern "C"` function pointer of type `S`.
///
/// The pointer returned by [`get`](Self::get) forwards every call, arguments and return value
/// unchanged, to the owned closure. It stays valid until the trampoline is dropped; the closure
/// is destroyed first and the code slot is released after it, so the slot can be reused by the
/// next trampoline.
///
/// Moving a `Trampoline` moves ownership of both the closure and the slot without touching
/// either, so the function pointer survives the move.
///
/// ```
/// use closure_trampoline::Trampoline;
///
/// let offset = 10;
/// let add: Trampoline<extern "C" fn(i32, i32) -> i32> =
///     Trampoline::new(move |a: i32, b: i32| a + b + offset)?;
///
/// let f = add.get();
/// assert_eq!(f(1, 2), 13);
/// # Ok::<(), closure_trampoline::Error>(())
/// ```
///
/// # Safety of the returned pointer
/// Nothing ties the lifetime of the function pointer to the trampoline. Calling it after the
/// trampoline was dropped executes `int3` or, once the slot is reused, an unrelated closure.
/// Calling it from another thread is only sound if the closure may be shared between threads.
/// A panic escaping the closure aborts the process.
pub struct Trampoline<'a, S: Signature> {
    code: S,
    // Dropped before `slot`, so the code stays mapped while the closure is torn down.
    callable: ErasedCallable,
    slot: Slot<'a>,
    len: usize,
}

impl<S: Signature> Trampoline<'static, S> {
    /// Build a trampoline for `callable` in the process-wide [`ExecPool`].
    pub fn new<F>(callable: F) -> Result<Self>
    where
        S: Bind<F>,
        F: 'static,
    {
        Self::new_in(ExecPool::global(), callable)
    }
}

impl<'a, S: Signature> Trampoline<'a, S> {
    /// Build a trampoline for `callable` in `pool`.
    ///
    /// The callable may borrow from anything that outlives the pool.
    pub fn new_in<F>(pool: &'a ExecPool, callable: F) -> Result<Self>
    where
        S: Bind<F>,
        F: 'a,
    {
        let callable = ErasedCallable::new::<S, F>(callable);
        let mut slot = pool.acquire()?;

        let layout = Layout::classify(S::PARAMS);
        let code = codegen::assemble(
            &layout,
            callable.data.as_ptr() as *const (),
            callable.dispatch,
            slot.as_ptr() as usize,
        )?;
        slot.write(&code)?;

        trace!(
            addr = ?slot.as_ptr(),
            strategy = ?layout.strategy(),
            len = code.len(),
            "emitted trampoline"
        );

        Ok(Self {
            code: unsafe { S::from_code(slot.as_ptr()) },
            callable,
            slot,
            len: code.len(),
        })
    }

    /// The native function pointer.
    pub fn get(&self) -> S {
        self.code
    }

    /// Address of the generated code.
    pub fn as_ptr(&self) -> *const u8 {
        self.slot.as_ptr()
    }

    /// Length of the generated code in bytes, excluding padding.
    pub fn code_len(&self) -> usize {
        self.len
    }
}

impl<S: Signature> fmt::Debug for Trampoline<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("code", &self.as_ptr())
            .field("callable", &self.callable.data)
            .field("slot", &self.slot.index())
            .field("len", &self.len)
            .finish()
    }
}
