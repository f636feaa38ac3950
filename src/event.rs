//! Call-controller event model.
//!
//! These are the messages a UA's state machine posts to its owning call
//! controller, and that the controller translates into signaling on the
//! other leg. Each carries an `origin` tag so the controller
//! knows which leg produced it without threading a separate parameter
//! through every handler.

use std::time::SystemTime;

/// Which leg of a call an event or action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallLeg {
    A,
    B,
}

impl CallLeg {
    pub fn other(self) -> Self {
        match self {
            CallLeg::A => CallLeg::B,
            CallLeg::B => CallLeg::A,
        }
    }
}

/// An event raised by a UA's state machine, destined for its call
/// controller. Named after the legacy "CC event" vocabulary the dispatcher
/// and state-transition tables both speak (`Try`, `Ring`, `Connect`, ...)
/// rather than after the SIP messages that triggered them, since more than
/// one SIP message can produce the same event (e.g. both a 180 and a 183
/// produce `Ring`).
#[derive(Debug, Clone)]
pub enum CcEvent {
    /// New attempt, about to send/forward an INVITE.
    Try { origin: CallLeg, rtime: SystemTime },
    /// Provisional response received (180/183/...).
    Ring {
        origin: CallLeg,
        rtime: SystemTime,
        code: u16,
    },
    /// Final response is a 2xx but media has not yet been confirmed
    /// (late-media / answer-in-2xx path, ACK will carry the offer).
    PreConnect {
        origin: CallLeg,
        rtime: SystemTime,
        code: u16,
    },
    /// Call is up: both legs have exchanged SDP and the dialog is
    /// confirmed.
    Connect { origin: CallLeg, rtime: SystemTime },
    /// Leg failed; `reason` is the human-readable string to surface on
    /// whatever BYE/CANCEL/final-response is synthesized for the other
    /// leg.
    Fail {
        origin: CallLeg,
        rtime: SystemTime,
        code: u16,
        reason: Option<String>,
    },
    /// 3xx with one or more Contact URIs to retry against.
    Redirect {
        origin: CallLeg,
        rtime: SystemTime,
        contacts: Vec<String>,
    },
    /// BYE, or CANCEL during early-dialog, on either leg.
    Disconnect { origin: CallLeg, rtime: SystemTime },
    /// Re-INVITE / UPDATE carrying a new SDP offer.
    Update {
        origin: CallLeg,
        rtime: SystemTime,
        sdp: Vec<u8>,
    },
    /// INFO, or any other mid-dialog request that doesn't change call
    /// state but still needs to be relayed to the other leg.
    Info {
        origin: CallLeg,
        rtime: SystemTime,
        payload: Vec<u8>,
    },
}

impl CcEvent {
    pub fn origin(&self) -> CallLeg {
        match self {
            CcEvent::Try { origin, .. }
            | CcEvent::Ring { origin, .. }
            | CcEvent::PreConnect { origin, .. }
            | CcEvent::Connect { origin, .. }
            | CcEvent::Fail { origin, .. }
            | CcEvent::Redirect { origin, .. }
            | CcEvent::Disconnect { origin, .. }
            | CcEvent::Update { origin, .. }
            | CcEvent::Info { origin, .. } => *origin,
        }
    }

    pub fn rtime(&self) -> SystemTime {
        match self {
            CcEvent::Try { rtime, .. }
            | CcEvent::Ring { rtime, .. }
            | CcEvent::PreConnect { rtime, .. }
            | CcEvent::Connect { rtime, .. }
            | CcEvent::Fail { rtime, .. }
            | CcEvent::Redirect { rtime, .. }
            | CcEvent::Disconnect { rtime, .. }
            | CcEvent::Update { rtime, .. }
            | CcEvent::Info { rtime, .. } => *rtime,
        }
    }

    /// Attaches or overwrites the failure reason on a `Fail` event;
    /// no-op on every other variant. Used when a transport-level timeout
    /// produces a bare `Fail` that the controller later enriches once it
    /// picks the SIP response code to synthesize.
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        if let CcEvent::Fail { reason: r, .. } = self {
            *r = Some(reason.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_leg_flips() {
        assert_eq!(CallLeg::A.other(), CallLeg::B);
        assert_eq!(CallLeg::B.other(), CallLeg::A);
    }

    #[test]
    fn set_reason_only_touches_fail() {
        let mut ring = CcEvent::Ring {
            origin: CallLeg::A,
            rtime: SystemTime::now(),
            code: 180,
        };
        ring.set_reason("ignored");

        let mut fail = CcEvent::Fail {
            origin: CallLeg::B,
            rtime: SystemTime::now(),
            code: 502,
            reason: None,
        };
        fail.set_reason("bad gateway");
        match fail {
            CcEvent::Fail { reason, .. } => assert_eq!(reason.as_deref(), Some("bad gateway")),
            _ => unreachable!(),
        }
    }
}
