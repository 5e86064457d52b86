//! Test helpers shared across Duet crates.

pub mod adapter;
pub mod store;

pub use adapter::{PanickingAdapter, ScriptedAdapter};
pub use store::FlakyStateStore;
