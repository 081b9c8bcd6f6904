//! Durable node properties (`currentTerm`, `votedFor`).

pub mod durable;
pub mod memory;
pub mod traits;

pub use durable::DurableProps;
pub use memory::MemoryProps;
pub use traits::{Patch, Properties};
