//! Call-scoped, non-owning erasure.

use std::marker::PhantomData;
use std::os::raw::c_void;

use crate::abi::RawClosure;
use crate::closure::{Closure, Repr, Signature};

/// Zero-allocation boundary view of a borrowed closure.
///
/// The record lives inline in this value and points directly at the
/// caller's closure; its destructor slot is empty, so dropping the view
/// releases nothing. The borrow ties the view to the source closure,
/// which therefore cannot be freed while the view exists. The far side
/// receives the record for one synchronous call only and must not store
/// the pointer past that call's return.
pub struct StackLift<'a, S: Signature> {
    view: View,
    _source: PhantomData<&'a Closure<S>>,
}

enum View {
    /// Inline record wrapping the caller's native callable.
    Inline(RawClosure),
    /// The source already wraps a foreign record; reuse it as-is.
    Reuse(*mut RawClosure),
}

impl<'a, S: Signature> StackLift<'a, S> {
    pub fn new(source: &'a Closure<S>) -> Self {
        let view = match source.repr() {
            Repr::Native(callable) => View::Inline(RawClosure {
                invoke: S::trampoline(),
                data: callable as *const S::Native as *mut c_void,
                destructor: None,
            }),
            Repr::Foreign(handle) => View::Reuse(handle.as_ptr()),
        };
        StackLift {
            view,
            _source: PhantomData,
        }
    }

    /// Record pointer to pass across the boundary; valid while `self`
    /// lives.
    pub fn as_raw(&mut self) -> *mut RawClosure {
        match &mut self.view {
            View::Inline(record) => record as *mut RawClosure,
            View::Reuse(raw) => *raw,
        }
    }
}
