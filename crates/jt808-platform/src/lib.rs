//! Platform-side JT/T 808 server.
//!
//! Accepts terminal connections over TCP, drives the registration and
//! authentication handshake, dispatches inbound traffic (location
//! reports, parameter responds, multimedia uploads with segmented
//! reassembly) and delivers firmware packages downstream with per-fragment
//! acknowledgement and gap retransmission.
//!
//! # Components
//!
//! - [`Platform`]: the server handle — bind, run, command and upgrade API
//! - [`PlatformConfig`]: listener endpoint and connection limits
//! - the `jt808-platform` binary: a runnable server with clap arguments
//!
//! The wire codec lives in [`jt808_proto`]; this crate only adds session
//! behavior on top of it.

#![forbid(unsafe_code)]

mod error;
mod server;

pub use error::PlatformError;
pub use server::{MultimediaCallback, Platform, PlatformConfig};
