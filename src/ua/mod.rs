//! Per-dialog user-agent state machine.
//!
//! A [`Ua`] is one leg of a call: the UAS side terminates the caller's
//! dialog, the UAC side originates the callee's. Both sides share the
//! same state shape ([`state::UaStateKind`]) and the same transition
//! entry points ([`state::recv_request`] for the UAS leg's inbound
//! INVITE, [`state::recv_response`] for the UAC leg's responses,
//! [`state::recv_event`] for CC-originated local events); only the
//! direction SIP messages flow differs.

pub mod dialog;
pub mod sdp;
pub mod state;

pub use dialog::{DialogId, TimerKind, Ua, UaRole};
pub use sdp::{SdpChangeHook, SdpResumeToken};
pub use state::UaStateKind;
