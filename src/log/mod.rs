//! The replicated command log.
//!
//! - `DurableLog`: sled-backed, one fsynced batch per entry
//! - `MemoryLog`: same contract over an ordered map, for tests
//! - `keys`: ordered byte-key codec for the backing store
//! - `Pairs`: aligns incoming entries with the existing log slice

pub mod durable;
pub mod entry;
pub mod keys;
pub mod memory;
pub mod pairs;
pub mod traits;

pub use durable::DurableLog;
pub use entry::{sentinel, ClusterConfig, Command, LogEntry, Peer};
pub use memory::MemoryLog;
pub use pairs::Pairs;
pub use traits::{AppendRequest, CommandLog, EntryIter};
