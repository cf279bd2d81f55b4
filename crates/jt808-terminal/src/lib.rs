//! Terminal-side JT/T 808 agent.
//!
//! Drives one connection to a monitoring platform: TCP connect, the
//! register/authenticate handshake, then a periodic location reporter and
//! a command dispatcher running side by side. Platform-pushed state
//! (terminal parameters, geofence polygons, firmware packages) lands in
//! local stores and is surfaced to the host through single-slot callbacks.
//!
//! # Components
//!
//! - [`Terminal`]: the session handle and host API
//! - [`TerminalConfig`]: endpoint, identity and timer configuration
//! - [`AreaStore`]: polygon geofences with enter/leave tracking
//! - [`BoundedQueue`]: drop-oldest FIFO between dispatcher and sender
//!
//! The wire codec lives in [`jt808_proto`]; this crate only adds session
//! behavior on top of it.

#![forbid(unsafe_code)]

mod client;
mod error;
mod geofence;
mod queue;

pub use client::{SessionState, Terminal, TerminalConfig};
pub use error::TerminalError;
pub use geofence::{AreaStore, GeofenceEvent, point_in_polygon};
pub use queue::BoundedQueue;
