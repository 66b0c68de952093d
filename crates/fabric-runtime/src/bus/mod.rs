//! The concrete `Bus` implementation this workspace ships.

pub mod in_process;

pub use in_process::InProcessBus;
