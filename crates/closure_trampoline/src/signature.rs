use std::{mem, ptr::NonNull};

/// Register class a parameter is assigned to by the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamClass {
    /// Passed in a general purpose register, or a stack word once those run out.
    Integer,
    /// Passed in a vector register, or a stack word once those run out.
    Float,
}

mod private {
    pub trait Sealed {}
}

/// A scalar that can be forwarded through a trampoline.
///
/// Implemented for the primitive integers, `bool`, `f32`, `f64` and thin pointers. Each of them
/// occupies exactly one register or stack word.
pub trait Param: private::Sealed + Copy {
    /// Class the calling convention assigns to this type.
    const CLASS: ParamClass;
}

/// A type that can be returned from a trampoline: any [`Param`] or `()`.
pub trait ReturnValue: private::Sealed {}

macro_rules! impl_scalar {
    ($class:ident: $($ty:ty),*) => {$(
        impl private::Sealed for $ty {}
        impl Param for $ty {
            const CLASS: ParamClass = ParamClass::$class;
        }
        impl ReturnValue for $ty {}
    )*};
}

impl_scalar!(Integer: i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, bool);
impl_scalar!(Float: f32, f64);

macro_rules! impl_pointer {
    ($($ptr:ty),*) => {$(
        impl<T> private::Sealed for $ptr {}
        impl<T> Param for $ptr {
            const CLASS: ParamClass = ParamClass::Integer;
        }
        impl<T> ReturnValue for $ptr {}
    )*};
}

impl_pointer!(*const T, *mut T, NonNull<T>);

impl private::Sealed for () {}
impl ReturnValue for () {}

/// A native function pointer type a trampoline can be generated for.
///
/// Implemented for `extern "C" fn(A0, .., An) -> R` with up to 20 [`Param`]s and a
/// [`ReturnValue`].
pub trait Signature: private::Sealed + Copy {
    /// Classes of the parameters, in declaration order.
    const PARAMS: &'static [ParamClass];

    /// Reinterpret the address of generated code as a function pointer of this type.
    ///
    /// # Safety
    /// `code` must point to executable code following this signature's calling convention.
    unsafe fn from_code(code: *const u8) -> Self;

    /// Address the function pointer refers to.
    fn as_ptr(self) -> *const u8;
}

/// Connects a [`Signature`] to a callable type `F` accepting the same arguments.
pub trait Bind<F>: Signature {
    /// Address of an `extern "C"` routine taking `*const F` followed by the parameters of the
    /// signature, which invokes the callable and returns its result.
    fn dispatcher() -> *const u8;
}

macro_rules! impl_signature {
    ($($arg:ident: $ty:ident),*) => {
        impl<R: ReturnValue, $($ty: Param),*> private::Sealed for extern "C" fn($($ty),*) -> R {}

        impl<R: ReturnValue, $($ty: Param),*> Signature for extern "C" fn($($ty),*) -> R {
            const PARAMS: &'static [ParamClass] = &[$($ty::CLASS),*];

            unsafe fn from_code(code: *const u8) -> Self {
                unsafe { mem::transmute_copy::<*const u8, Self>(&code) }
            }

            fn as_ptr(self) -> *const u8 {
                self as *const u8
            }
        }

        impl<F, R: ReturnValue, $($ty: Param),*> Bind<F> for extern "C" fn($($ty),*) -> R
        where
            F: Fn($($ty),*) -> R,
        {
            fn dispatcher() -> *const u8 {
                #[allow(improper_ctypes_definitions)]
                extern "C" fn dispatch<F, R, $($ty),*>(callable: *const F, $($arg: $ty),*) -> R
                where
                    F: Fn($($ty),*) -> R,
                {
                    unsafe { (*callable)($($arg),*) }
                }

                let dispatch: extern "C" fn(*const F, $($ty),*) -> R = dispatch::<F, R, $($ty),*>;
                dispatch as *const u8
            }
        }
    };
}

impl_signature!();
impl_signature!(a0: A0);
impl_signature!(a0: A0, a1: A1);
impl_signature!(a0: A0, a1: A1, a2: A2);
impl_signature!(a0: A0, a1: A1, a2: A2, a3: A3);
impl_signature!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4);
impl_signature!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);
impl_signature!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);
impl_signature!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7);
impl_signature!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13, a14: A14
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13, a14: A14, a15: A15
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13, a14: A14, a15: A15, a16: A16
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13, a14: A14, a15: A15, a16: A16, a17: A17
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13, a14: A14, a15: A15, a16: A16, a17: A17, a18: A18
);
impl_signature!(
    a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7, a8: A8, a9: A9, a10: A10,
    a11: A11, a12: A12, a13: A13, a14: A14, a15: A15, a16: A16, a17: A17, a18: A18, a19: A19
);
