//! Gangway - a call boundary for nested functional closures.
//!
//! Libraries built from higher-order numeric routines (an integrator that
//! accepts a function and bounds, a spectrum that is itself a function)
//! cannot hand their closures to consumers that understand only plain
//! function pointers and opaque data. This crate defines the crossing:
//!
//! - every closure, of any arity and nesting, travels as one fixed-layout
//!   [`RawClosure`] record ([`lift`] erases, [`lower`] reconstructs,
//!   recursively for closure-typed parameters and results);
//! - failures travel out-of-band through a per-thread error channel
//!   instead of unwinding across the boundary ([`error`]);
//! - the heap state behind a record has exactly one owner and is released
//!   exactly once; [`StackLift`] erases a borrowed closure for a single
//!   call without allocating or transferring ownership.
//!
//! The mathematics the closures compute is someone else's business; this
//! crate only moves callables and their failures across the boundary.

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod abi;
pub mod boundary;
pub mod closure;
pub mod error;
pub mod stack;

pub use abi::{RawClosure, RawDestructor, RawInvoke};
pub use boundary::{Boundary, Sentinel};
pub use closure::{lift, lower, lower_borrowed, Closure, Signature};
pub use error::{CallError, CallResult, ForeignError, NativeError, NATIVE_LAYER};
pub use stack::StackLift;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        // Smoke test to verify the crate builds and tests run
        assert_eq!(VERSION, "0.1.0");
    }
}
