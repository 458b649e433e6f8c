//! The boundary error channel.
//!
//! Failures never cross the boundary as native control flow. A failing
//! call parks its error here, one slot per thread, and returns a sentinel
//! result instead; the consumer reads the slot immediately after the call,
//! before trusting the result. A caller that skips the check gets an
//! indistinguishable-from-valid but wrong value, which is part of the
//! sentinel contract.

use std::any::Any;
use std::cell::Cell;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use thiserror::Error;

/// Layer tag for errors produced by this side of the boundary.
///
/// Spells "Rust" in little-endian ASCII. Each layer tags the payloads it
/// produces and only interprets payloads carrying its own tag.
pub const NATIVE_LAYER: c_int = 0x7473_7552;

/// Exported copy of [`NATIVE_LAYER`] for foreign consumers.
#[no_mangle]
pub static GANGWAY_NATIVE_LAYER: c_int = NATIVE_LAYER;

/// A failure raised by native code during a boundary call.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NativeError {
    message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Recover a message from a captured panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "panic during boundary call".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for NativeError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for NativeError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A failure that originated on the far side of the boundary.
///
/// The payload is an opaque token owned by the layer that produced it;
/// only that layer may interpret or release it. Dropping a `ForeignError`
/// leaves the token alive for its producer. Handing the error back to the
/// channel (when it passes outward through a trampoline) restores payload
/// and layer verbatim.
#[derive(Debug, Error)]
#[error("foreign error (layer {layer:#010x})")]
pub struct ForeignError {
    payload: *mut c_void,
    layer: c_int,
}

impl ForeignError {
    pub fn new(payload: *mut c_void, layer: c_int) -> Self {
        Self { payload, layer }
    }

    pub fn payload(&self) -> *mut c_void {
        self.payload
    }

    pub fn layer(&self) -> c_int {
        self.layer
    }
}

/// Failure observed when calling through the boundary.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error(transparent)]
    Foreign(#[from] ForeignError),
}

impl CallError {
    /// Shorthand for a message-bearing native failure.
    pub fn native(message: impl Into<String>) -> Self {
        CallError::Native(NativeError::new(message))
    }
}

/// Result of invoking a closure on either side of the boundary.
pub type CallResult<T> = Result<T, CallError>;

#[derive(Clone, Copy)]
struct Slot {
    payload: *mut c_void,
    layer: c_int,
}

const EMPTY: Slot = Slot {
    payload: ptr::null_mut(),
    layer: 0,
};

thread_local! {
    static SLOT: Cell<Slot> = const { Cell::new(EMPTY) };
}

/// Heap record behind a native-layer payload pointer. Owns the original
/// error plus a rendered message whose pointer stays valid for as long as
/// the payload is pending.
struct NativePayload {
    error: NativeError,
    message: CString,
}

/// True when a failure is waiting to be consumed on this thread.
pub fn pending() -> bool {
    SLOT.with(|slot| !slot.get().payload.is_null())
}

/// Drop the pending failure, if any. Native payloads are released here;
/// foreign payloads are left to the layer that produced them.
pub fn clear() {
    SLOT.with(|slot| {
        let current = slot.get();
        if current.payload.is_null() {
            return;
        }
        if current.layer == NATIVE_LAYER {
            unsafe { drop(Box::from_raw(current.payload as *mut NativePayload)) };
        }
        slot.set(EMPTY);
    });
}

/// Park a native failure, releasing any previous payload first.
pub(crate) fn set_native(error: NativeError) {
    clear();
    let message = CString::new(error.message.replace('\0', " ")).unwrap_or_default();
    let payload = Box::into_raw(Box::new(NativePayload { error, message }));
    SLOT.with(|slot| {
        slot.set(Slot {
            payload: payload.cast(),
            layer: NATIVE_LAYER,
        })
    });
}

/// Re-park a failure that is passing back across the boundary, payload and
/// layer untouched.
pub(crate) fn set_raw(payload: *mut c_void, layer: c_int) {
    clear();
    SLOT.with(|slot| slot.set(Slot { payload, layer }));
}

/// Record a call failure right before a sentinel is returned.
pub(crate) fn record(error: CallError) {
    match error {
        CallError::Native(native) => set_native(native),
        CallError::Foreign(foreign) => set_raw(foreign.payload, foreign.layer),
    }
}

pub(crate) fn record_panic(payload: Box<dyn Any + Send>) {
    set_native(NativeError::from_panic(payload));
}

/// Consume the pending failure, if any.
///
/// A native payload is reclaimed and yields the original error; a foreign
/// payload is handed over inside [`CallError::Foreign`].
pub(crate) fn take() -> Option<CallError> {
    SLOT.with(|slot| {
        let current = slot.get();
        if current.payload.is_null() {
            return None;
        }
        slot.set(EMPTY);
        if current.layer == NATIVE_LAYER {
            let payload = unsafe { Box::from_raw(current.payload as *mut NativePayload) };
            Some(CallError::Native(payload.error))
        } else {
            Some(CallError::Foreign(ForeignError {
                payload: current.payload,
                layer: current.layer,
            }))
        }
    })
}

/// Pending payload for this thread, or null. Ownership stays with the
/// channel until [`gangway_clear_error`] or the next overwrite.
#[no_mangle]
pub extern "C" fn gangway_get_error() -> *mut c_void {
    SLOT.with(|slot| slot.get().payload)
}

/// Layer tag of the pending payload, or zero when the channel is empty.
#[no_mangle]
pub extern "C" fn gangway_get_error_layer() -> c_int {
    SLOT.with(|slot| slot.get().layer)
}

/// Park a foreign failure before returning a sentinel across the boundary.
///
/// # Safety
///
/// `payload` must stay valid until the error is cleared or overwritten,
/// and `layer` must identify the layer able to release it.
#[no_mangle]
pub unsafe extern "C" fn gangway_set_error(payload: *mut c_void, layer: c_int) {
    set_raw(payload, layer);
}

/// Drop the pending failure, if any.
#[no_mangle]
pub extern "C" fn gangway_clear_error() {
    clear();
}

/// Message text of a native-layer payload obtained from
/// [`gangway_get_error`]. The pointer is valid for as long as the payload
/// is; null in, null out.
///
/// # Safety
///
/// `payload` must be null or a payload tagged [`GANGWAY_NATIVE_LAYER`].
#[no_mangle]
pub unsafe extern "C" fn gangway_error_message(payload: *mut c_void) -> *const c_char {
    if payload.is_null() {
        return ptr::null();
    }
    (*(payload as *const NativePayload)).message.as_ptr()
}
