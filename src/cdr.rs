//! Call detail records.
//!
//! Narrowed to the fields the signaling plane actually knows: this crate
//! sees no RTP, so per-call MOS/jitter/codec figures belong to whatever
//! consumes [`AaaEngine::account`], not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDetailRecord {
    pub cc_id: u64,
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub disconnect_reason: DisconnectReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Normal,
    Busy,
    NoAnswer,
    Rejected,
    NetworkError,
    Timeout,
    Forbidden,
    NotFound,
    ServerError,
}

impl DisconnectReason {
    /// Best-effort mapping from a final SIP status code, used when a CC
    /// synthesizes a CDR at teardown and has nothing but the code the
    /// peer leg failed with.
    pub fn from_sip_status(code: u16) -> Self {
        match code {
            486 | 600 => DisconnectReason::Busy,
            487 => DisconnectReason::NoAnswer,
            403 => DisconnectReason::Forbidden,
            404 => DisconnectReason::NotFound,
            408 => DisconnectReason::Timeout,
            503 => DisconnectReason::NetworkError,
            500..=599 => DisconnectReason::ServerError,
            _ => DisconnectReason::Rejected,
        }
    }
}

impl CallDetailRecord {
    pub fn duration(&self) -> u64 {
        match (self.answer_time, self.end_time) {
            (Some(answer), Some(end)) => (end - answer).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_reason_maps_common_codes() {
        assert_eq!(DisconnectReason::from_sip_status(486), DisconnectReason::Busy);
        assert_eq!(DisconnectReason::from_sip_status(487), DisconnectReason::NoAnswer);
        assert_eq!(DisconnectReason::from_sip_status(404), DisconnectReason::NotFound);
        assert_eq!(DisconnectReason::from_sip_status(502), DisconnectReason::ServerError);
    }

    #[test]
    fn duration_is_zero_without_answer() {
        let cdr = CallDetailRecord {
            cc_id: 1,
            call_id: "call-1".to_string(),
            caller: "alice".to_string(),
            callee: "bob".to_string(),
            start_time: Utc::now(),
            answer_time: None,
            end_time: Some(Utc::now()),
            duration_seconds: 0,
            disconnect_reason: DisconnectReason::NoAnswer,
        };
        assert_eq!(cdr.duration(), 0);
    }
}
