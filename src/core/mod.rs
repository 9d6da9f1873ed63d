//! Runtime core: script generations and their lifecycle.
//!
//! Public API from this module is [`Agent`] (lifecycle manager) and
//! [`Generation`] (one loaded script).
//!
//! Internal modules:
//! - [`generation`]: owns the Lua state, registries and event queue of one script;
//! - [`lifecycle`]: update checks, generation swap, the agent select loop;
//! - [`registry`]: name-keyed task map shared by the capability modules;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod generation;
mod lifecycle;
mod registry;
mod shutdown;

pub use generation::{Dispatch, Generation};
pub use lifecycle::{Agent, Phase};
pub use shutdown::{cancel_on_signal, wait_for_shutdown_signal};

pub(crate) use registry::Registry;
