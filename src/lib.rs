//! vertex-b2bua - a SIP back-to-back user agent
//!
//! Terminates an inbound SIP dialog from a caller, originates a second,
//! independent dialog toward a callee, and bridges the two so provisional
//! responses, answer, re-INVITE/SDP changes, BYE and CANCEL all flow
//! correctly between them. Media itself is not touched here: SDP is
//! negotiated through this crate but carried by an external relay.

pub mod aaa;
pub mod call_map;
pub mod cc;
pub mod cdr;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod sip;
pub mod ua;
pub mod utils;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
