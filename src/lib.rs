#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod bitswarm;
pub use bitswarm::*;

mod bit_store;
pub use bit_store::*;

mod rate_limiter;
pub use rate_limiter::*;

mod fanout;
pub use fanout::*;

mod abuse_guard;
pub use abuse_guard::*;

mod toggle_log;
pub use toggle_log::*;

mod origin;
pub use origin::*;

mod local;
pub use local::*;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use redis::*;

mod error;
pub use error::*;

mod bitset;
pub use bitset::*;

mod snapshot;
pub use snapshot::*;

mod event;
pub use event::*;

mod common;
pub use common::{
    BitIndex, CapacityCap, DEFAULT_TOTAL_BITS, ToggleOutcome, TotalBits, WindowLimit,
    WindowSizeSeconds,
};

#[cfg(test)]
mod tests;
