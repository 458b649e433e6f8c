//! Per-type boundary conversions.
//!
//! [`Boundary`] decides, position by position, how a value crosses: plain
//! values pass through unchanged, closure values are replaced by a raw
//! record pointer. Nested closure-typed parameters and results recurse
//! through the same trait.

use std::ptr;

use crate::abi::RawClosure;

/// Default value returned in place of a result when a boundary call
/// fails. Valid only together with a pending error-channel entry.
pub trait Sentinel {
    fn sentinel() -> Self;
}

/// A type that can cross the boundary.
pub trait Boundary: Sized + 'static {
    /// Representation at the boundary: `Self` for plain values, a raw
    /// record pointer for closures.
    type Raw: Copy + Sentinel;

    /// Call-scoped erased view of a borrowed value.
    type Stack<'a>
    where
        Self: 'a;

    /// Erase an owned value. Heap resources move into the produced form.
    fn lift(self) -> Self::Raw;

    /// Erase a borrowed value for the duration of one call.
    fn stack_lift(&self) -> Self::Stack<'_>;

    /// Raw form of a stack view; valid while the view lives.
    fn stack_raw(view: &mut Self::Stack<'_>) -> Self::Raw;

    /// Reconstruct an argument the far side still owns.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid boundary form of `Self` and must outlive
    /// every use of the reconstructed value.
    unsafe fn lower_borrowed(raw: Self::Raw) -> Self;

    /// Reconstruct a result, taking ownership of its heap resources.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid boundary form of `Self`; for closure types
    /// the record is consumed and must not be used again by the caller.
    unsafe fn lower_owned(raw: Self::Raw) -> Self;
}

macro_rules! plain {
    ($($t:ty => $zero:expr),* $(,)?) => {$(
        impl Sentinel for $t {
            #[inline]
            fn sentinel() -> Self {
                $zero
            }
        }

        impl Boundary for $t {
            type Raw = $t;
            type Stack<'a> = $t where Self: 'a;

            #[inline]
            fn lift(self) -> $t {
                self
            }

            #[inline]
            fn stack_lift(&self) -> $t {
                *self
            }

            #[inline]
            fn stack_raw(view: &mut $t) -> $t {
                *view
            }

            #[inline]
            unsafe fn lower_borrowed(raw: $t) -> $t {
                raw
            }

            #[inline]
            unsafe fn lower_owned(raw: $t) -> $t {
                raw
            }
        }
    )*};
}

plain! {
    () => (),
    bool => false,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    isize => 0,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    f32 => 0.0,
    f64 => 0.0,
}

impl Sentinel for *mut RawClosure {
    #[inline]
    fn sentinel() -> Self {
        ptr::null_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_cross_unchanged() {
        assert_eq!(3.5_f64.lift(), 3.5);
        assert_eq!(unsafe { f64::lower_owned(3.5) }, 3.5);
        assert_eq!(unsafe { i32::lower_borrowed(-7) }, -7);
        assert!(true.lift());
    }

    #[test]
    fn sentinels_are_zero_shaped() {
        assert_eq!(f64::sentinel(), 0.0);
        assert_eq!(i64::sentinel(), 0);
        assert!(!bool::sentinel());
        assert!(<*mut RawClosure>::sentinel().is_null());
    }

    #[test]
    fn stack_views_of_plain_values_are_copies() {
        let x = 2.0_f64;
        let mut view = x.stack_lift();
        assert_eq!(f64::stack_raw(&mut view), 2.0);
    }
}
