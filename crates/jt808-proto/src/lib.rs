//! Wire codec for the JT/T 808 vehicle telematics protocol.
//!
//! JT/T 808 is a binary, framed, connection-oriented protocol spoken
//! between vehicle terminals and a monitoring platform over TCP. Every
//! message travels as `7E | header | body | bcc | 7E` with the interior
//! escaped so the delimiter byte never appears inside it.
//!
//! # Architecture
//!
//! - [`frame`]: delimiters, escaping, XOR checksum, stream splitting
//! - [`bcd`]: BCD ⇄ string conversions for phone numbers and timestamps
//! - [`MsgHeader`]/[`BodyAttr`]: the message header
//! - parameter model: [`LocationBasic`], [`RegisterInfo`],
//!   [`TerminalParams`], [`PolygonArea`], upgrade/multimedia records,
//!   aggregated per connection in [`SessionParams`]
//! - [`Packager`]: message-id-indexed body encoders producing wire frames
//! - [`Parser`]: the mirror-image decoder table
//!
//! Both tables support runtime [`Packager::append`]/
//! [`Packager::override_handler`] so vendor messages can be wired in at
//! startup without forking the codec.
//!
//! Everything on the wire is big-endian. Message bodies are not encrypted;
//! the header reserves bits for it but no cipher is mandated here.

#![forbid(unsafe_code)]

pub mod area;
pub mod bcd;
mod error;
pub mod frame;
mod header;
pub mod location;
pub mod messages;
mod packager;
pub mod params;
mod parser;
mod session;

pub use area::{AreaAttr, LatLon, PolygonArea, PolygonAreaSet};
pub use error::{ProtocolError, Result};
pub use frame::FrameSplitter;
pub use header::{BodyAttr, MsgHeader};
pub use location::{AlarmFlags, LocationBasic, LocationExtensions, StatusFlags};
pub use messages::{
    FillPacket, LocationTrackingControl, MultimediaUpload, MultimediaUploadAck, RegisterInfo,
    UpgradeInfo, is_respond_only, msg_id,
};
pub use packager::{EncodeHandler, Packager};
pub use params::TerminalParams;
pub use parser::{DecodeHandler, Parser};
pub use session::{ParsedParams, SessionParams};
