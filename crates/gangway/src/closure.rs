//! Typed closures and their erased forms.
//!
//! [`Closure<S>`] is the native handle for a callable of shape `S`, a
//! fn-pointer marker type such as `fn(f64) -> f64`. [`lift`] erases one
//! into a heap [`RawClosure`] callable from outside; [`lower`]
//! reconstructs one from a record received from outside, recursively for
//! nested closure-typed positions. One trampoline is monomorphized per
//! concrete signature; there is no runtime dispatch by signature.

use std::fmt;
use std::mem;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::abi::{self, RawClosure, RawInvoke};
use crate::boundary::{Boundary, Sentinel};
use crate::error::{self, CallResult};
use crate::stack::StackLift;

/// Call shapes that can cross the boundary.
///
/// Implemented for `fn(A1, …, An) -> R` marker types up to arity six,
/// where every parameter and the result implement [`Boundary`].
pub trait Signature: 'static {
    /// The native callable stored behind a lifted closure of this shape.
    type Native: Clone + 'static;

    /// The trampoline lift installs for this shape, as the type-erased
    /// invoke slot. Its identity doubles as the lower fast-path key.
    fn trampoline() -> RawInvoke;
}

/// Typed handle to a callable on either side of the boundary.
///
/// Closures are reference-counted and single-threaded; clones share the
/// underlying callable or foreign record.
pub struct Closure<S: Signature> {
    repr: Repr<S>,
}

pub(crate) enum Repr<S: Signature> {
    /// Defined on this side; calls run without crossing the boundary.
    Native(S::Native),
    /// Obtained from the far side; calls go through the invoke slot.
    Foreign(Rc<ForeignHandle>),
}

/// Grip on a foreign record. Owned handles release the record on drop;
/// borrowed ones leave it to the far side.
pub(crate) struct ForeignHandle {
    raw: NonNull<RawClosure>,
    owned: bool,
}

impl ForeignHandle {
    pub(crate) fn as_ptr(&self) -> *mut RawClosure {
        self.raw.as_ptr()
    }

    /// Give up ownership of the record without destroying it.
    fn into_raw(self) -> *mut RawClosure {
        let raw = self.raw.as_ptr();
        mem::forget(self);
        raw
    }
}

impl Drop for ForeignHandle {
    fn drop(&mut self) {
        if self.owned {
            unsafe { abi::destroy(self.raw.as_ptr()) };
        }
    }
}

impl<S: Signature> Closure<S> {
    pub(crate) fn repr(&self) -> &Repr<S> {
        &self.repr
    }

    /// True when calls run natively, without crossing the boundary.
    pub fn is_native(&self) -> bool {
        matches!(self.repr, Repr::Native(_))
    }

    /// Wrap a record received from the far side.
    ///
    /// # Safety
    ///
    /// `raw` must point to a live record whose invoke slot matches the
    /// signature derived from `S`. When `owned`, the record is consumed;
    /// otherwise it must outlive every call made through the handle.
    pub(crate) unsafe fn from_raw(raw: *mut RawClosure, owned: bool) -> Self {
        debug_assert!(!raw.is_null());
        let record = &*raw;
        // A record erased by this same signature's lift carries our
        // trampoline; recover the stored callable directly instead of
        // wrapping the round trip.
        if record.invoke as usize == S::trampoline() as usize {
            let callable = (*(record.data as *const S::Native)).clone();
            if owned {
                abi::destroy(raw);
            }
            return Closure {
                repr: Repr::Native(callable),
            };
        }
        Closure {
            repr: Repr::Foreign(Rc::new(ForeignHandle {
                raw: NonNull::new_unchecked(raw),
                owned,
            })),
        }
    }
}

impl<S: Signature> Clone for Closure<S> {
    fn clone(&self) -> Self {
        let repr = match &self.repr {
            Repr::Native(callable) => Repr::Native(callable.clone()),
            Repr::Foreign(handle) => Repr::Foreign(Rc::clone(handle)),
        };
        Closure { repr }
    }
}

impl<S: Signature> fmt::Debug for Closure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.repr {
            Repr::Native(_) => "native",
            Repr::Foreign(_) => "foreign",
        };
        f.debug_struct("Closure").field("side", &side).finish()
    }
}

/// Erase a value into its boundary form.
///
/// For closures, ownership of the produced record passes to the caller;
/// release it with [`gangway_destroy_closure`](crate::abi::gangway_destroy_closure)
/// or by lowering it back with ownership. A null record means
/// construction failed and the error channel holds the reason.
pub fn lift<T: Boundary>(value: T) -> T::Raw {
    value.lift()
}

/// Reconstruct a native value from an owned boundary form.
///
/// # Safety
///
/// `raw` must be a valid boundary form of `T`; for closure types the
/// record is consumed by this call.
pub unsafe fn lower<T: Boundary>(raw: T::Raw) -> T {
    T::lower_owned(raw)
}

/// Reconstruct a native value from a boundary form the far side keeps
/// ownership of.
///
/// # Safety
///
/// `raw` must stay valid for as long as the reconstructed value is used.
pub unsafe fn lower_borrowed<T: Boundary>(raw: T::Raw) -> T {
    T::lower_borrowed(raw)
}

macro_rules! signatures {
    ($(($($A:ident $a:ident $view:ident),*))*) => {$(
        impl<R, $($A,)*> Signature for fn($($A,)*) -> R
        where
            R: Boundary,
            $($A: Boundary,)*
        {
            type Native = Rc<dyn Fn($($A,)*) -> CallResult<R>>;

            fn trampoline() -> RawInvoke {
                #[allow(improper_ctypes_definitions)]
                unsafe extern "C" fn trampoline<R, $($A,)*>(
                    $($a: $A::Raw,)*
                    data: *mut c_void,
                ) -> R::Raw
                where
                    R: Boundary,
                    $($A: Boundary,)*
                {
                    let callable = &*(data as *const Rc<dyn Fn($($A,)*) -> CallResult<R>>);
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        $(let $a = unsafe { $A::lower_borrowed($a) };)*
                        (**callable)($($a),*)
                    }));
                    match outcome {
                        Ok(Ok(result)) => result.lift(),
                        Ok(Err(failure)) => {
                            error::record(failure);
                            <R::Raw as Sentinel>::sentinel()
                        }
                        Err(payload) => {
                            error::record_panic(payload);
                            <R::Raw as Sentinel>::sentinel()
                        }
                    }
                }
                unsafe {
                    mem::transmute::<
                        unsafe extern "C" fn($(<$A as Boundary>::Raw,)* *mut c_void) -> <R as Boundary>::Raw,
                        RawInvoke,
                    >(trampoline::<R, $($A,)*>)
                }
            }
        }

        impl<R, $($A,)*> Closure<fn($($A,)*) -> R>
        where
            R: Boundary,
            $($A: Boundary,)*
        {
            /// Wrap a fallible native callable.
            pub fn new<F>(callable: F) -> Self
            where
                F: Fn($($A,)*) -> CallResult<R> + 'static,
            {
                // Coerce to the erased callable type up front; the enum
                // constructor alone does not unsize `Rc<F>`.
                let callable: <fn($($A,)*) -> R as Signature>::Native = Rc::new(callable);
                Closure {
                    repr: Repr::Native(callable),
                }
            }

            /// Wrap a native callable that cannot fail.
            pub fn from_fn<F>(callable: F) -> Self
            where
                F: Fn($($A,)*) -> R + 'static,
            {
                Self::new(move |$($a),*| Ok(callable($($a),*)))
            }

            /// Invoke the closure.
            ///
            /// Calls on a foreign handle cross the boundary: closure-typed
            /// arguments are stack-lifted for the duration of the call, and
            /// a pending error-channel entry afterwards surfaces as `Err`
            /// without the raw result being interpreted.
            pub fn call(&self, $($a: $A),*) -> CallResult<R> {
                match &self.repr {
                    Repr::Native(callable) => (**callable)($($a),*),
                    Repr::Foreign(handle) => {
                        let raw = handle.as_ptr();
                        let invoke = unsafe {
                            mem::transmute::<
                                RawInvoke,
                                unsafe extern "C" fn($(<$A as Boundary>::Raw,)* *mut c_void) -> <R as Boundary>::Raw,
                            >((*raw).invoke)
                        };
                        $(let mut $view = $a.stack_lift();)*
                        let result = unsafe {
                            invoke($($A::stack_raw(&mut $view),)* (*raw).data)
                        };
                        if let Some(failure) = error::take() {
                            return Err(failure);
                        }
                        Ok(unsafe { R::lower_owned(result) })
                    }
                }
            }
        }

        impl<R, $($A,)*> Boundary for Closure<fn($($A,)*) -> R>
        where
            R: Boundary,
            $($A: Boundary,)*
        {
            type Raw = *mut RawClosure;
            type Stack<'a> = StackLift<'a, fn($($A,)*) -> R> where Self: 'a;

            fn lift(self) -> *mut RawClosure {
                match self.repr {
                    Repr::Native(callable) => {
                        let data = Box::into_raw(Box::new(callable)) as *mut c_void;
                        abi::make(
                            <fn($($A,)*) -> R as Signature>::trampoline(),
                            data,
                            Some(abi::drop_boxed::<<fn($($A,)*) -> R as Signature>::Native>),
                        )
                    }
                    Repr::Foreign(handle) => match Rc::try_unwrap(handle) {
                        // Sole owner of a foreign record: hand the original
                        // record back instead of wrapping it a second time.
                        Ok(handle) if handle.owned => handle.into_raw(),
                        Ok(handle) => {
                            let this: Closure<fn($($A,)*) -> R> = Closure {
                                repr: Repr::Foreign(Rc::new(handle)),
                            };
                            Closure::<fn($($A,)*) -> R>::new(move |$($a),*| this.call($($a),*))
                                .lift()
                        }
                        Err(shared) => {
                            let this: Closure<fn($($A,)*) -> R> = Closure {
                                repr: Repr::Foreign(shared),
                            };
                            Closure::<fn($($A,)*) -> R>::new(move |$($a),*| this.call($($a),*))
                                .lift()
                        }
                    },
                }
            }

            fn stack_lift(&self) -> StackLift<'_, fn($($A,)*) -> R> {
                StackLift::new(self)
            }

            fn stack_raw(view: &mut Self::Stack<'_>) -> *mut RawClosure {
                view.as_raw()
            }

            unsafe fn lower_borrowed(raw: *mut RawClosure) -> Self {
                Self::from_raw(raw, false)
            }

            unsafe fn lower_owned(raw: *mut RawClosure) -> Self {
                Self::from_raw(raw, true)
            }
        }
    )*};
}

signatures! {
    ()
    (A1 a1 v1)
    (A1 a1 v1, A2 a2 v2)
    (A1 a1 v1, A2 a2 v2, A3 a3 v3)
    (A1 a1 v1, A2 a2 v2, A3 a3 v3, A4 a4 v4)
    (A1 a1 v1, A2 a2 v2, A3 a3 v3, A4 a4 v4, A5 a5 v5)
    (A1 a1 v1, A2 a2 v2, A3 a3 v3, A4 a4 v4, A5 a5 v5, A6 a6 v6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::gangway_destroy_closure;
    use crate::error::{CallError, NATIVE_LAYER};
    use std::ptr;

    #[test]
    fn native_calls_stay_native() {
        let double = Closure::<fn(f64) -> f64>::from_fn(|x| x * 2.0);
        assert!(double.is_native());
        assert_eq!(double.call(4.0).unwrap(), 8.0);
    }

    #[test]
    fn lower_after_lift_recovers_the_original_callable() {
        let square = Closure::<fn(f64) -> f64>::from_fn(|x| x * x);
        let raw = lift(square);
        let back: Closure<fn(f64) -> f64> = unsafe { lower(raw) };
        assert!(back.is_native());
        assert_eq!(back.call(3.0).unwrap(), 9.0);
    }

    #[test]
    fn clones_share_the_callable() {
        let counterless = Closure::<fn(i64) -> i64>::from_fn(|n| n + 1);
        let twin = counterless.clone();
        assert_eq!(counterless.call(1).unwrap(), 2);
        assert_eq!(twin.call(2).unwrap(), 3);
    }

    #[test]
    fn failed_calls_park_the_error_and_return_a_sentinel() {
        let reciprocal = Closure::<fn(f64) -> f64>::new(|x| {
            if x == 0.0 {
                Err(CallError::native("division by zero"))
            } else {
                Ok(1.0 / x)
            }
        });
        let raw = lift(reciprocal);
        let record = unsafe { &*raw };
        let invoke = unsafe {
            mem::transmute::<RawInvoke, unsafe extern "C" fn(f64, *mut c_void) -> f64>(
                record.invoke,
            )
        };

        assert_eq!(unsafe { invoke(2.0, record.data) }, 0.5);
        assert!(!error::pending());

        assert_eq!(unsafe { invoke(0.0, record.data) }, 0.0);
        assert!(error::pending());
        assert_eq!(crate::error::gangway_get_error_layer(), NATIVE_LAYER);
        error::clear();

        unsafe { gangway_destroy_closure(raw) };
    }

    #[test]
    fn panics_do_not_unwind_across_the_boundary() {
        let hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));

        let brittle = Closure::<fn(f64) -> f64>::from_fn(|_| panic!("integrand out of domain"));
        let raw = lift(brittle);
        let record = unsafe { &*raw };
        let invoke = unsafe {
            mem::transmute::<RawInvoke, unsafe extern "C" fn(f64, *mut c_void) -> f64>(
                record.invoke,
            )
        };
        let result = unsafe { invoke(1.0, record.data) };
        panic::set_hook(hook);

        assert_eq!(result, 0.0);
        match error::take() {
            Some(CallError::Native(error)) => {
                assert_eq!(error.message(), "integrand out of domain")
            }
            other => panic!("unexpected channel contents: {other:?}"),
        }
        unsafe { gangway_destroy_closure(raw) };
    }

    unsafe extern "C" fn triple(x: f64, _data: *mut c_void) -> f64 {
        x * 3.0
    }

    fn triple_record() -> *mut RawClosure {
        crate::abi::gangway_make_closure(
            unsafe {
                mem::transmute::<unsafe extern "C" fn(f64, *mut c_void) -> f64, RawInvoke>(triple)
            },
            ptr::null_mut(),
            None,
        )
    }

    #[test]
    fn foreign_records_lower_through_the_general_path() {
        let raw = triple_record();
        let tripler: Closure<fn(f64) -> f64> = unsafe { lower(raw) };
        assert!(!tripler.is_native());
        assert_eq!(tripler.call(2.0).unwrap(), 6.0);
    }

    #[test]
    fn lifting_a_uniquely_owned_foreign_handle_returns_the_original_record() {
        let raw = triple_record();
        let tripler: Closure<fn(f64) -> f64> = unsafe { lower(raw) };
        let lifted = lift(tripler);
        assert_eq!(lifted, raw);
        unsafe { gangway_destroy_closure(lifted) };
    }

    #[test]
    fn lifting_a_shared_foreign_handle_rewraps_it() {
        let raw = triple_record();
        let tripler: Closure<fn(f64) -> f64> = unsafe { lower(raw) };
        let keeper = tripler.clone();
        let lifted = lift(tripler);
        assert_ne!(lifted, raw);
        let back: Closure<fn(f64) -> f64> = unsafe { lower(lifted) };
        assert_eq!(back.call(1.0).unwrap(), 3.0);
        assert_eq!(keeper.call(2.0).unwrap(), 6.0);
    }

    #[test]
    fn lifting_a_borrowed_foreign_handle_rewraps_it() {
        let raw = triple_record();
        let tripler: Closure<fn(f64) -> f64> = unsafe { lower_borrowed(raw) };
        let lifted = lift(tripler);
        assert_ne!(lifted, raw);
        let back: Closure<fn(f64) -> f64> = unsafe { lower(lifted) };
        assert_eq!(back.call(2.0).unwrap(), 6.0);
        drop(back);
        unsafe { gangway_destroy_closure(raw) };
    }

    #[test]
    fn borrowed_lowering_leaves_ownership_with_the_caller() {
        let raw = triple_record();
        {
            let tripler: Closure<fn(f64) -> f64> = unsafe { lower_borrowed(raw) };
            assert_eq!(tripler.call(4.0).unwrap(), 12.0);
        }
        // The handle dropped without destroying the record.
        let again: Closure<fn(f64) -> f64> = unsafe { lower(raw) };
        assert_eq!(again.call(1.0).unwrap(), 3.0);
    }
}
