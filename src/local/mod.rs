//! In-process backend.
//!
//! The local backend keeps the bitset, the toggle channel, the toggle log and
//! the rate-limit tickets inside the current process.
//!
//! # Key Characteristics
//!
//! - **Thread-safe:** one mutex around the bitset and count, [`DashMap`](dashmap::DashMap) for tickets
//! - **No external dependencies:** no network or database required
//! - **Process-scoped:** nothing is shared with other processes or survives a restart
//!
//! # When to Use
//!
//! ✅ **Use the local backend when:**
//! - Running a single front-end process
//! - Developing or testing without Redis
//!
//! ❌ **Don't use the local backend when:**
//! - Several front-end processes must see the same bitset
//! - State must survive restarts

mod local_bit_store;
pub use local_bit_store::*;

mod local_ticket_ledger;
pub use local_ticket_ledger::*;
