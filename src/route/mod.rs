//! Route tables: the RIB (learned/configured routes) and the FIB
//! (compiled next-hop lookup derived from it).
//!
//! The pair is rebuilt wholesale and swapped behind `Arc` on change, never
//! patched incrementally; readers holding an old snapshot keep a consistent
//! view.

mod fib;
mod rib;

pub use fib::Fib;
pub use rib::{Rib, RouteEntry};

/// Network mask for a prefix length.
pub(crate) fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}
