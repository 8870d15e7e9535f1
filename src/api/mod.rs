//! The user-facing API surface.
//!
//! `types` is the externally published vocabulary (states, summaries);
//! `backend` is the thin write path that turns user intents into custom
//! resources for the controllers to act on.

pub mod backend;
pub mod types;

pub use backend::Backend;
