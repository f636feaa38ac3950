//! UA state variants and transition functions.
//!
//! States are a closed enum rather than a class hierarchy: each variant is
//! plain data, and the transition functions below are free functions keyed
//! on `match`. Rust's exhaustiveness checking on the match arms does the
//! job a trait-object dispatch table would otherwise need a runtime check
//! for.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::CcEvent;
use crate::sip::message::{SipRequest, SipResponse};
use crate::sip::transaction::ServerTransaction;
use crate::ua::dialog::{TimerKind, Ua};
use crate::ua::sdp::SdpResumeToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UaStateKind {
    Idle,
    Trying,
    Ringing,
    /// `late_media_pending` is set while a B-leg 2xx arrived with an SDP
    /// body under `late_media=true`: the leg is "connected" for signaling
    /// purposes but still waiting on the ACK to carry the real answer.
    Connected { late_media_pending: bool },
    Disconnecting,
    Disconnected,
    Failed { code: u16 },
    /// Carries the last provisional code seen, since that determines
    /// whether the transaction manager sends CANCEL (a provisional was
    /// seen) or relies on a synthesized final response.
    Cancelling { last_code: Option<u16> },
}

impl UaStateKind {
    pub fn label(&self) -> &'static str {
        match self {
            UaStateKind::Idle => "Idle",
            UaStateKind::Trying => "Trying",
            UaStateKind::Ringing => "Ringing",
            UaStateKind::Connected { .. } => "Connected",
            UaStateKind::Disconnecting => "Disconnecting",
            UaStateKind::Disconnected => "Disconnected",
            UaStateKind::Failed { .. } => "Failed",
            UaStateKind::Cancelling { .. } => "Cancelling",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UaStateKind::Disconnected | UaStateKind::Failed { .. }
        )
    }
}

/// A local call-control event delivered to a UA by its CC (as opposed to a
/// `CcEvent` the UA *produces*). Only `Fail`/`Redirect`/`Disconnect` are
/// accepted while `Ringing` or `Trying`, and only `Update`/`Disconnect`
/// once `Connected`.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    Fail,
    Redirect,
    Disconnect,
    Update(Vec<u8>),
}

pub fn on_activation(ua: &mut Ua, rtime: SystemTime) {
    if let UaStateKind::Idle = ua.state {
        ua.state = UaStateKind::Trying;
        ua.arm_expire();
        ua.arm_no_progress();
        ua.enqueue(CcEvent::Try {
            origin: ua.leg,
            rtime,
        });
    }
}

/// Handles the inbound request that creates this UA's dialog (the UAS
/// leg's INVITE). Captures the server transaction the dispatcher built for
/// it, adopts the caller's offer as this leg's remote SDP, and activates
/// the leg exactly as the UAC leg does on its own `Try`.
pub fn recv_request(
    ua: &mut Ua,
    request: &SipRequest,
    server_txn: Option<Arc<dyn ServerTransaction>>,
    rtime: SystemTime,
) -> Result<()> {
    match &ua.state {
        UaStateKind::Idle => {
            ua.server_txn = server_txn;
            if let Ok(cseq) = request.cseq() {
                ua.remote_cseq = cseq;
            }
            if !request.0.body.is_empty() {
                ua.remote_sdp = Some(request.0.body.clone());
            }
            on_activation(ua, rtime);
            Ok(())
        }
        other => Err(Error::invalid_state(format!(
            "initial request received while UA in {}",
            other.label()
        ))),
    }
}

/// Handles an inbound SIP response while `Trying` or `Ringing`. This is
/// the representative, most intricate transition in the state machine.
pub async fn recv_response(ua: &mut Ua, resp: &SipResponse) -> Result<()> {
    match &ua.state {
        UaStateKind::Trying | UaStateKind::Ringing => recv_response_ringing(ua, resp).await,
        other => Err(Error::invalid_state(format!(
            "response received while UA in {:?}",
            other
        ))),
    }
}

async fn recv_response_ringing(ua: &mut Ua, resp: &SipResponse) -> Result<()> {
    let code = resp.status_code_u16();
    let now = SystemTime::now();

    if code > 180 {
        ua.last_provisional_code = Some(code);
    }

    if code < 200 {
        if ua.p1xx_ts.is_none() {
            ua.p1xx_ts = Some(now);
            ua.cancel_no_progress();
        }
        let body = (!resp.0.body.is_empty()).then(|| resp.0.body.clone());
        if let Some(body) = body {
            ua.remote_sdp = Some(run_through_sdp_hook(ua, body).await);
        }
        ua.enqueue(CcEvent::Ring {
            origin: ua.leg,
            rtime: now,
            code,
        });
        ua.state = UaStateKind::Ringing;
        return Ok(());
    }

    if (200..300).contains(&code) {
        let to_tag = resp.to_tag()?;
        let tag = match to_tag {
            Some(tag) => tag,
            None => {
                // A 2xx with no To-tag is malformed beyond repair: we
                // cannot even identify the dialog it claims to confirm.
                ua.enqueue(CcEvent::Fail {
                    origin: ua.leg,
                    rtime: now,
                    code: 502,
                    reason: Some("Bad Gateway".to_string()),
                });
                ua.state = UaStateKind::Failed { code: 502 };
                ua.cancel_all_timers();
                return Ok(());
            }
        };
        ua.dialog.remote_tag = Some(tag);
        ua.route_set = resp.record_route_values();
        ua.cancel_expire();
        ua.cancel_no_progress();

        let has_body = !resp.0.body.is_empty();
        if has_body {
            ua.remote_sdp = Some(run_through_sdp_hook(ua, resp.0.body.clone()).await);
        }

        if !ua.late_media || !has_body {
            ua.enqueue(CcEvent::Connect {
                origin: ua.leg,
                rtime: now,
            });
            ua.connect_ts = Some(now);
            ua.state = UaStateKind::Connected {
                late_media_pending: false,
            };
        } else {
            ua.enqueue(CcEvent::PreConnect {
                origin: ua.leg,
                rtime: now,
                code,
            });
            ua.pending_tr = true;
            ua.state = UaStateKind::Connected {
                late_media_pending: true,
            };
        }
        ua.arm_credit();
        if ua.reinvite_interval.is_some() {
            ua.arm_reinvite();
        }
        return Ok(());
    }

    if code == 401 || code == 407 {
        if !ua.auth_retried {
            ua.auth_retried = true;
            ua.local_cseq += 1;
            debug!(call_id = %ua.dialog.call_id, code, "challenged once, arming a single authenticated retry");
            ua.state = UaStateKind::Trying;
            return Ok(());
        }
        // Retry budget exhausted: a second challenge on the same dialog
        // falls through to the generic failure path below.
    }

    if matches!(code, 300..=302) {
        let contacts = resp.contact_uris();
        if !contacts.is_empty() {
            ua.enqueue(CcEvent::Redirect {
                origin: ua.leg,
                rtime: now,
                contacts,
            });
            ua.set_disconnect_ts_clamped(now);
            ua.state = UaStateKind::Failed { code };
            ua.cancel_all_timers();
            return Ok(());
        }
    }

    ua.enqueue(CcEvent::Fail {
        origin: ua.leg,
        rtime: now,
        code,
        reason: None,
    });
    ua.set_disconnect_ts_clamped(now);
    ua.state = UaStateKind::Failed { code };
    ua.cancel_all_timers();
    Ok(())
}

/// Runs a newly arrived SDP body past the installed media-relay hook, if
/// any, and returns whatever body should actually be cached as
/// `remote_sdp`. With no hook installed the body is adopted unchanged.
async fn run_through_sdp_hook(ua: &Ua, body: Vec<u8>) -> Vec<u8> {
    let Some(hook) = ua.sdp_hook.clone() else {
        return body;
    };
    let (token, rx) = SdpResumeToken::new(ua.dialog.call_id.clone());
    hook.on_remote_sdp_change(body.clone(), token).await;
    rx.await.unwrap_or(body)
}

/// Handles a local CC-originated event. `Fail`/`Redirect`/`Disconnect` are
/// accepted while `Trying`/`Ringing`; `Update`/`Disconnect` once
/// `Connected`. Anything else is a caller bug against this state.
pub async fn recv_event(ua: &mut Ua, event: LocalEvent) -> Result<()> {
    match (&ua.state, &event) {
        (UaStateKind::Trying | UaStateKind::Ringing, LocalEvent::Fail)
        | (UaStateKind::Trying | UaStateKind::Ringing, LocalEvent::Redirect)
        | (UaStateKind::Trying | UaStateKind::Ringing, LocalEvent::Disconnect) => {
            if let Some(txn) = ua.client_txn.clone() {
                txn.cancel().await?;
            }
            let now = SystemTime::now();
            ua.set_disconnect_ts_clamped(now);
            let last_code = ua.last_provisional_code;
            ua.state = UaStateKind::Cancelling { last_code };
            ua.cancel_all_timers();
            Ok(())
        }
        (UaStateKind::Connected { .. }, LocalEvent::Disconnect) => {
            let now = SystemTime::now();
            ua.set_disconnect_ts_clamped(now);
            ua.state = UaStateKind::Disconnecting;
            ua.cancel_all_timers();
            debug!(call_id = %ua.dialog.call_id, "connected leg moving to Disconnecting");
            Ok(())
        }
        (UaStateKind::Connected { .. }, LocalEvent::Update(_)) => {
            let sdp = match event {
                LocalEvent::Update(sdp) => sdp,
                _ => unreachable!(),
            };
            ua.local_sdp = Some(run_through_sdp_hook(ua, sdp).await);
            debug!(call_id = %ua.dialog.call_id, "applied mid-dialog SDP update");
            Ok(())
        }
        (state, _) => Err(Error::invalid_state(format!(
            "event {:?} not accepted in state {}",
            event,
            state.label()
        ))),
    }
}

/// Drives the state transition for a timer that has fired.
/// `Expire`/`NoProgress` behave like a transport-level `408`; `Credit`
/// behaves like a local `BYE`; `Reinvite` just re-arms itself, since a
/// session-refresh due date is advisory, not a failure.
pub fn fire_timer(ua: &mut Ua, kind: TimerKind) {
    if ua.state.is_terminal() {
        return;
    }
    match kind {
        TimerKind::Expire | TimerKind::NoProgress => {
            let now = SystemTime::now();
            warn!(call_id = %ua.dialog.call_id, ?kind, "timer expired, failing leg");
            ua.enqueue(CcEvent::Fail {
                origin: ua.leg,
                rtime: now,
                code: 408,
                reason: Some("Request Timeout".to_string()),
            });
            ua.set_disconnect_ts_clamped(now);
            ua.state = UaStateKind::Failed { code: 408 };
            ua.cancel_all_timers();
        }
        TimerKind::Credit => {
            if matches!(ua.state, UaStateKind::Connected { .. }) {
                let now = SystemTime::now();
                debug!(call_id = %ua.dialog.call_id, "credit time exhausted, disconnecting");
                ua.enqueue(CcEvent::Disconnect {
                    origin: ua.leg,
                    rtime: now,
                });
                ua.set_disconnect_ts_clamped(now);
                ua.state = UaStateKind::Disconnecting;
                ua.cancel_all_timers();
            }
        }
        TimerKind::Reinvite => {
            if matches!(ua.state, UaStateKind::Connected { .. }) {
                debug!(call_id = %ua.dialog.call_id, "session-refresh reinvite due");
                ua.arm_reinvite();
            }
        }
    }
}

/// Terminal confirmation that a BYE (or its ACK) went out.
pub fn mark_disconnected(ua: &mut Ua) {
    if ua.state.is_terminal() {
        warn!(call_id = %ua.dialog.call_id, "mark_disconnected called on already-terminal UA");
        return;
    }
    ua.state = UaStateKind::Disconnected;
    ua.cancel_all_timers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CallLeg;
    use crate::ua::dialog::{Ua, UaRole};
    use rsip::headers::{Contact, To as ToHeader};
    use rsip::{Header, Response, StatusCode, Version};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_ua() -> Ua {
        let (tx, _rx) = mpsc::unbounded_channel();
        Ua::new(
            UaRole::Uac,
            CallLeg::B,
            "call-1@example.com".to_string(),
            "tagA".to_string(),
            false,
            Duration::from_secs(32),
            Duration::from_secs(8),
            None,
            None,
            tx,
            std::sync::Weak::new(),
        )
    }

    fn response(status: StatusCode, to_tag: Option<&str>, body: Vec<u8>) -> SipResponse {
        let to_value = match to_tag {
            Some(tag) => format!("<sip:bob@example.com>;tag={}", tag),
            None => "<sip:bob@example.com>".to_string(),
        };
        SipResponse::from(Response {
            status_code: status,
            version: Version::V2,
            headers: vec![Header::To(ToHeader::from(to_value))].into(),
            body,
        })
    }

    #[tokio::test]
    async fn tagless_200_fails_with_bad_gateway_and_synthesizes_bye_intent() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Trying;
        let resp = response(StatusCode::OK, None, vec![]);
        recv_response(&mut ua, &resp).await.unwrap();
        match ua.state {
            UaStateKind::Failed { code: 502 } => {}
            other => panic!("expected Failed(502), got {:?}", other),
        }
        assert!(matches!(
            ua.pending_events().back(),
            Some(CcEvent::Fail { code: 502, .. })
        ));
    }

    #[tokio::test]
    async fn tagged_200_without_late_media_connects_immediately() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Trying;
        let resp = response(StatusCode::OK, Some("tagB"), b"v=0".to_vec());
        recv_response(&mut ua, &resp).await.unwrap();
        assert_eq!(ua.state, UaStateKind::Connected { late_media_pending: false });
        assert!(ua.connect_ts.is_some());
    }

    #[tokio::test]
    async fn tagged_200_with_body_under_late_media_preconnects() {
        let mut ua = test_ua();
        ua.late_media = true;
        ua.state = UaStateKind::Trying;
        let resp = response(StatusCode::OK, Some("tagB"), b"v=0".to_vec());
        recv_response(&mut ua, &resp).await.unwrap();
        assert_eq!(
            ua.state,
            UaStateKind::Connected { late_media_pending: true }
        );
        assert!(ua.connect_ts.is_none());
        assert!(matches!(
            ua.pending_events().back(),
            Some(CcEvent::PreConnect { .. })
        ));
    }

    #[tokio::test]
    async fn redirect_with_contact_emits_redirect_and_fails_state() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Ringing;
        let mut resp = response(StatusCode::MovedTemporarily, None, vec![]);
        resp.0
            .headers
            .push(Header::Contact(Contact::from("<sip:b@host2>")));
        recv_response(&mut ua, &resp).await.unwrap();
        match ua.state {
            UaStateKind::Failed { code: 302 } => {}
            other => panic!("expected Failed(302), got {:?}", other),
        }
        assert!(matches!(
            ua.pending_events().back(),
            Some(CcEvent::Redirect { contacts, .. }) if contacts.len() == 1
        ));
    }

    #[tokio::test]
    async fn first_401_arms_one_retry_without_failing() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Trying;
        let resp = response(StatusCode::Unauthorized, None, vec![]);
        recv_response(&mut ua, &resp).await.unwrap();
        assert_eq!(ua.state, UaStateKind::Trying);
        assert!(ua.auth_retried);
    }

    #[tokio::test]
    async fn second_401_on_same_dialog_fails_terminally() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Trying;
        let resp = response(StatusCode::Unauthorized, None, vec![]);
        recv_response(&mut ua, &resp).await.unwrap();
        recv_response(&mut ua, &resp).await.unwrap();
        match ua.state {
            UaStateKind::Failed { code: 401 } => {}
            other => panic!("expected Failed(401), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_disconnect_during_ringing_moves_to_cancelling() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Ringing;
        ua.last_provisional_code = Some(180);
        recv_event(&mut ua, LocalEvent::Disconnect).await.unwrap();
        match ua.state {
            UaStateKind::Cancelling { last_code: Some(180) } => {}
            other => panic!("expected Cancelling(180), got {:?}", other),
        }
        assert!(ua.disconnect_ts.is_some());
    }

    #[tokio::test]
    async fn update_event_rejected_outside_connected() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Ringing;
        assert!(recv_event(&mut ua, LocalEvent::Update(vec![])).await.is_err());
    }

    #[tokio::test]
    async fn update_event_applied_while_connected() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Connected { late_media_pending: false };
        recv_event(&mut ua, LocalEvent::Update(b"v=0".to_vec())).await.unwrap();
        assert_eq!(ua.local_sdp.as_deref(), Some(b"v=0".as_slice()));
    }

    #[test]
    fn disconnect_ts_never_precedes_setup_ts() {
        let mut ua = test_ua();
        let earlier = ua.setup_ts - std::time::Duration::from_secs(10);
        ua.set_disconnect_ts_clamped(earlier);
        assert!(ua.disconnect_ts.unwrap() >= ua.setup_ts);
    }

    #[test]
    fn expire_timer_fires_into_a_408_failure() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Trying;
        ua.arm_expire();
        fire_timer(&mut ua, TimerKind::Expire);
        match ua.state {
            UaStateKind::Failed { code: 408 } => {}
            other => panic!("expected Failed(408), got {:?}", other),
        }
    }

    #[test]
    fn credit_timer_fires_into_disconnecting() {
        let mut ua = test_ua();
        ua.state = UaStateKind::Connected { late_media_pending: false };
        fire_timer(&mut ua, TimerKind::Credit);
        assert_eq!(ua.state, UaStateKind::Disconnecting);
    }
}
