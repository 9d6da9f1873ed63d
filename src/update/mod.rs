//! # Script updates: where new versions come from and where the last one is kept.
//!
//! - [`UpdateSource`] - async seam to the control server (metadata + content)
//! - [`HttpUpdateSource`] - reqwest implementation used by the binary
//! - [`UpdateResponse`] / [`UpdateConfig`] - update metadata wire format
//! - [`ScriptStore`] - local cache of the last accepted script

mod response;
mod source;
mod store;

pub use response::{UpdateConfig, UpdateResponse};
pub use source::{HttpUpdateSource, UpdateSource};
pub use store::ScriptStore;
