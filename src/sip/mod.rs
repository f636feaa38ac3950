//! SIP message and transaction plumbing.
//!
//! The B2BUA core never talks wire bytes: parsing and transport belong to
//! the `rsip` crate and to whatever transaction manager is wired in at
//! the edge (see [`transaction`]). This module only adds the handful of
//! accessors the call-control layer actually needs: tag extraction,
//! Via-based remote-address resolution, and pass-through header copying.

pub mod message;
pub mod transaction;

pub use message::{SipRequest, SipResponse};
pub use transaction::{ClientTransaction, ServerTransaction, TransactionManager};
