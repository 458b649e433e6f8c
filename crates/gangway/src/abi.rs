//! The fixed-layout boundary record.
//!
//! Everything that crosses the boundary travels as a [`RawClosure`]: an
//! invoke slot, an opaque data pointer, and a nullable destructor. The
//! record's own type never encodes a call signature; each side casts the
//! invoke slot to the signature it expects. A mismatched cast is a caller
//! error the protocol cannot detect.

use std::os::raw::c_void;

/// Type-erased invoke slot.
///
/// Cast to the signature derived from the closure's own: every
/// closure-typed parameter and result is replaced by `*mut RawClosure`,
/// and the data pointer is appended as the last parameter.
pub type RawInvoke = unsafe extern "C" fn();

/// Type-erased destructor for an owned `data` pointer.
pub type RawDestructor = unsafe extern "C" fn(*mut c_void);

/// Uniform representation of a closure at the boundary.
///
/// Exactly one of two ownership states holds: `destructor` is set and
/// `data` is a heap allocation owned by this record, or `destructor` is
/// `None` and `data` borrows a caller-held native closure. A borrowed
/// record must not outlive the closure it points at.
#[repr(C)]
pub struct RawClosure {
    pub invoke: RawInvoke,
    pub data: *mut c_void,
    pub destructor: Option<RawDestructor>,
}

/// Allocate an owned boundary record.
pub(crate) fn make(
    invoke: RawInvoke,
    data: *mut c_void,
    destructor: Option<RawDestructor>,
) -> *mut RawClosure {
    Box::into_raw(Box::new(RawClosure {
        invoke,
        data,
        destructor,
    }))
}

/// Release a record: run its destructor, then free the record itself.
///
/// # Safety
///
/// `raw` must be null or a record obtained from [`make`] /
/// [`gangway_make_closure`] that has not been released before, and it
/// must not be used afterwards.
pub(crate) unsafe fn destroy(raw: *mut RawClosure) {
    if raw.is_null() {
        return;
    }
    let record = Box::from_raw(raw);
    if let Some(destructor) = record.destructor {
        destructor(record.data);
    }
}

/// Drop glue installed as the destructor of lifted closures, monomorphized
/// per stored callable type.
pub(crate) unsafe extern "C" fn drop_boxed<T>(data: *mut c_void) {
    drop(Box::from_raw(data as *mut T));
}

/// Construct an owned boundary record from its parts.
///
/// The returned record must be released exactly once with
/// [`gangway_destroy_closure`]; the destructor, if any, runs at that
/// point.
#[no_mangle]
pub extern "C" fn gangway_make_closure(
    invoke: RawInvoke,
    data: *mut c_void,
    destructor: Option<RawDestructor>,
) -> *mut RawClosure {
    make(invoke, data, destructor)
}

/// Destroy a record obtained from [`gangway_make_closure`] or from
/// lifting. Null is ignored.
///
/// # Safety
///
/// `raw` must not have been destroyed before and must not be used
/// afterwards. Records received as call arguments are borrowed and must
/// never be passed here.
#[no_mangle]
pub unsafe extern "C" fn gangway_destroy_closure(raw: *mut RawClosure) {
    destroy(raw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn noop_invoke() {}

    #[test]
    fn destroy_runs_the_destructor_exactly_once() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn counting(_data: *mut c_void) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }

        let raw = gangway_make_closure(noop_invoke, ptr::null_mut(), Some(counting));
        unsafe { gangway_destroy_closure(raw) };
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroying_null_is_a_no_op() {
        unsafe { gangway_destroy_closure(ptr::null_mut()) };
    }

    #[test]
    fn borrowed_records_carry_no_destructor() {
        let raw = gangway_make_closure(noop_invoke, ptr::null_mut(), None);
        unsafe {
            assert!((*raw).destructor.is_none());
            gangway_destroy_closure(raw);
        }
    }

    #[test]
    fn record_layout_is_three_pointers() {
        assert_eq!(
            mem::size_of::<RawClosure>(),
            3 * mem::size_of::<*const ()>()
        );
    }
}
