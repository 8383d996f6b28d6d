//! Redis backend.
//!
//! Shares the bitset across any number of front-end processes. Writes go to
//! the primary, reads to an optional replica, and toggle events travel over
//! Redis pub/sub. All read-modify-write paths are Lua scripts.

mod common;
pub use common::*;

mod redis_bit_store;
pub use redis_bit_store::*;

mod redis_ticket_ledger;
pub use redis_ticket_ledger::*;
