//! Relay and metrics pipeline for inspecting a page's reactive digest cycle.
//!
//! Samples flow from a page producer through the [`broker`] into a panel-side
//! [`collector`], which buffers them and derives plot series on demand.

pub mod broker;
pub mod clock;
pub mod collector;
pub mod config;
pub mod export;
pub mod poller;
pub mod protocol;
pub mod session;
