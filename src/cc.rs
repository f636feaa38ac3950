//! Call controller: couples a caller-side UAS and callee-side UAC.
//!
//! Mirrors the shape of a service that owns a table of live calls and
//! drains their events off an internal channel, narrowed to a single
//! call per controller (the call map is what aggregates many of these).
//! The two UAs are protected by one `tokio::sync::Mutex` -- a session
//! lock -- so a translation from one leg to the other can never be
//! observed half-applied.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::aaa::{AaaEngine, AuthDecision};
use crate::cdr::{CallDetailRecord, DisconnectReason};
use crate::error::Result;
use crate::event::{CallLeg, CcEvent};
use crate::sip::message::{SipRequest, SipResponse};
use crate::sip::transaction::{ServerTransaction, TransactionManager};
use crate::ua::dialog::{Ua, UaRole};
use crate::ua::state::{self, LocalEvent, UaStateKind};

pub type Cc = Arc<CcInner>;

struct CcState {
    ua_a: Ua,
    ua_b: Ua,
    pass_through_headers: Vec<(String, String)>,
}

pub struct CcInner {
    pub id: u64,
    pub call_id: String,
    pub created_at: SystemTime,
    pub proxied: bool,
    pub late_media: bool,
    aaa: Arc<dyn AaaEngine>,
    state: Mutex<CcState>,
    events_tx: mpsc::UnboundedSender<(CallLeg, CcEvent)>,
    accounted: std::sync::atomic::AtomicBool,
}

/// Per-dialog timer durations handed to both legs, sourced from
/// `B2buaConfig`'s timer attributes.
#[derive(Debug, Clone, Copy)]
pub struct UaTimers {
    pub expire_timeout: Duration,
    pub no_progress_timeout: Duration,
    pub credit_time: Option<Duration>,
    pub reinvite_interval: Option<Duration>,
}

impl CcInner {
    /// Constructs a new CC for an inbound INVITE, with both UAs freshly
    /// `Idle` and wired to post events back into this controller's
    /// translation loop.
    pub fn new(
        id: u64,
        call_id: String,
        late_media: bool,
        pass_through_headers: Vec<(String, String)>,
        transaction_manager: Arc<dyn TransactionManager>,
        aaa: Arc<dyn AaaEngine>,
        timers: UaTimers,
    ) -> Cc {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let cc = Arc::new_cyclic(|weak: &Weak<CcInner>| {
            let ua_a = Ua::new(
                UaRole::Uas,
                CallLeg::A,
                call_id.clone(),
                format!("{}-a", id),
                late_media,
                timers.expire_timeout,
                timers.no_progress_timeout,
                timers.credit_time,
                timers.reinvite_interval,
                events_tx.clone(),
                weak.clone(),
            );
            let ua_b = Ua::new(
                UaRole::Uac,
                CallLeg::B,
                call_id.clone(),
                format!("{}-b", id),
                late_media,
                timers.expire_timeout,
                timers.no_progress_timeout,
                timers.credit_time,
                timers.reinvite_interval,
                events_tx.clone(),
                weak.clone(),
            );
            CcInner {
                id,
                call_id,
                created_at: SystemTime::now(),
                proxied: false,
                late_media,
                aaa,
                state: Mutex::new(CcState {
                    ua_a,
                    ua_b,
                    pass_through_headers,
                }),
                events_tx,
                accounted: std::sync::atomic::AtomicBool::new(false),
            }
        });

        tokio::spawn(Self::run_event_loop(
            Arc::downgrade(&cc),
            events_rx,
            transaction_manager,
        ));
        tokio::spawn(Self::run_timer_loop(Arc::downgrade(&cc)));
        cc
    }

    /// Hands the inbound INVITE to the A-leg UA, capturing the server
    /// transaction the dispatcher built for it and activating the leg.
    /// This is what starts the call: the `Try` event `on_activation`
    /// enqueues is what the translation loop below uses to originate the
    /// B-leg's own INVITE.
    pub async fn accept_initial_invite(
        &self,
        request: SipRequest,
        server_txn: Arc<dyn ServerTransaction>,
    ) -> Result<()> {
        let rtime = SystemTime::now();
        let mut state = self.state.lock().await;
        state::recv_request(&mut state.ua_a, &request, Some(server_txn), rtime)
    }

    async fn run_event_loop(
        weak: Weak<CcInner>,
        mut events_rx: mpsc::UnboundedReceiver<(CallLeg, CcEvent)>,
        transaction_manager: Arc<dyn TransactionManager>,
    ) {
        while let Some((origin, event)) = events_rx.recv().await {
            let Some(cc) = weak.upgrade() else { break };
            if let Err(err) = CcInner::translate(&cc, origin, event, &transaction_manager).await {
                warn!(cc_id = cc.id, error = %err, "CC event translation failed");
            }
        }
    }

    /// Polls both legs' timers once a second and drives whichever fires.
    /// A single shared ticker rather than a `tokio::time::sleep` per
    /// timer: four timers per leg share one session lock, so coalescing
    /// the checks avoids eight concurrent sleepers per call.
    async fn run_timer_loop(weak: Weak<CcInner>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let Some(cc) = weak.upgrade() else { break };
            let now = Instant::now();
            let mut state = cc.state.lock().await;
            if let Some(kind) = state.ua_a.due_timer(now) {
                state::fire_timer(&mut state.ua_a, kind);
            }
            if let Some(kind) = state.ua_b.due_timer(now) {
                state::fire_timer(&mut state.ua_b, kind);
            }
            drop(state);
            cc.account_if_terminal(DisconnectReason::Timeout).await;
        }
    }

    /// Applies the leg-to-leg translation table. Only the A/B state flip
    /// happens under the session lock; sending the resulting SIP message
    /// (or originating a brand-new client transaction) happens after the
    /// lock is released so a slow transport write can't stall the other
    /// leg's own translations.
    async fn translate(
        cc: &Arc<CcInner>,
        origin: CallLeg,
        event: CcEvent,
        transaction_manager: &Arc<dyn TransactionManager>,
    ) -> Result<()> {
        let span = crate::utils::dialog_span(cc.id, &cc.call_id);
        async move {
        let peer_leg = origin.other();
        debug!(?origin, "translating CC event to peer leg");

        match event {
            CcEvent::Try { rtime, .. } => {
                let is_uac = {
                    let mut state = cc.state.lock().await;
                    let peer = state.peer_mut(peer_leg);
                    state::on_activation(peer, rtime);
                    peer.role == UaRole::Uac
                };
                if is_uac {
                    CcInner::originate_client_invite(cc, peer_leg, transaction_manager).await?;
                }
            }
            CcEvent::Ring { code, .. } => {
                let txn = {
                    let mut state = cc.state.lock().await;
                    state.peer_mut(peer_leg).server_txn.clone()
                };
                if let Some(txn) = txn {
                    if let Err(err) = txn.respond(provisional_response(code)).await {
                        warn!(cc_id = cc.id, error = %err, "failed to relay provisional response");
                    }
                }
            }
            CcEvent::PreConnect { code, .. } => {
                CcInner::relay_final_response(cc, origin, peer_leg, code).await;
            }
            CcEvent::Connect { .. } => {
                CcInner::relay_final_response(cc, origin, peer_leg, 200).await;
            }
            CcEvent::Fail { code, .. } => {
                {
                    let mut state = cc.state.lock().await;
                    let peer = state.peer_mut(peer_leg);
                    state::recv_event(peer, LocalEvent::Fail).await.ok();
                }
                debug!(cc_id = cc.id, code, "peer leg notified of failure");
                cc.account_if_terminal(DisconnectReason::from_sip_status(code))
                    .await;
            }
            CcEvent::Redirect { .. } => {
                let mut state = cc.state.lock().await;
                let peer = state.peer_mut(peer_leg);
                state::recv_event(peer, LocalEvent::Redirect).await.ok();
            }
            CcEvent::Disconnect { .. } => {
                {
                    let mut state = cc.state.lock().await;
                    let peer = state.peer_mut(peer_leg);
                    state::recv_event(peer, LocalEvent::Disconnect).await.ok();
                }
                cc.account_if_terminal(DisconnectReason::Normal).await;
            }
            CcEvent::Update { sdp, .. } => {
                let mut state = cc.state.lock().await;
                let peer = state.peer_mut(peer_leg);
                if let Err(err) = state::recv_event(peer, LocalEvent::Update(sdp)).await {
                    warn!(cc_id = cc.id, error = %err, "SDP update rejected by peer leg");
                }
            }
            CcEvent::Info { .. } => {
                // Relayed opaquely; nothing to change in either UA's state.
            }
        }
        Ok(())
        }
        .instrument(span)
        .await
    }

    /// Sends the final response the negotiating leg's outcome implies
    /// onto the peer's server transaction, carrying whatever SDP body
    /// the originating leg just received as the answer.
    async fn relay_final_response(cc: &Arc<CcInner>, origin: CallLeg, peer_leg: CallLeg, code: u16) {
        let (txn, body) = {
            let mut state = cc.state.lock().await;
            let body = state.peer_mut(origin).remote_sdp.clone();
            (state.peer_mut(peer_leg).server_txn.clone(), body)
        };
        if let Some(txn) = txn {
            if let Err(err) = txn.respond(final_response(code, body)).await {
                warn!(cc_id = cc.id, error = %err, "failed to relay final response");
            }
        }
    }

    /// Originates (or re-originates, for an authenticated retry) the
    /// outbound INVITE for `leg` and stores the resulting client
    /// transaction. Spawns a listener that feeds every response for this
    /// transaction back through the leg's state machine.
    async fn originate_client_invite(
        cc: &Arc<CcInner>,
        leg: CallLeg,
        transaction_manager: &Arc<dyn TransactionManager>,
    ) -> Result<()> {
        let (offer, pass_through_headers, auth_retried) = {
            let state = cc.state.lock().await;
            let ua = state.peer(leg);
            (
                ua.remote_sdp.clone(),
                state.pass_through_headers.clone(),
                ua.auth_retried,
            )
        };
        let request =
            build_outbound_invite(cc, leg, offer, &pass_through_headers, auth_retried).await;

        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let txn = transaction_manager
            .begin_client_transaction(request, responses_tx)
            .await?;
        {
            let mut state = cc.state.lock().await;
            state.peer_mut(leg).client_txn = Some(txn);
        }
        CcInner::spawn_response_listener(cc, leg, responses_rx, transaction_manager.clone());
        Ok(())
    }

    fn spawn_response_listener(
        cc: &Arc<CcInner>,
        leg: CallLeg,
        mut responses_rx: mpsc::UnboundedReceiver<SipResponse>,
        transaction_manager: Arc<dyn TransactionManager>,
    ) {
        let cc = Arc::clone(cc);
        tokio::spawn(async move {
            while let Some(resp) = responses_rx.recv().await {
                let needs_retry = {
                    let mut state = cc.state.lock().await;
                    let ua = state.peer_mut(leg);
                    match state::recv_response(ua, &resp).await {
                        Ok(()) => ua.auth_retried && ua.state == UaStateKind::Trying,
                        Err(err) => {
                            warn!(cc_id = cc.id, error = %err, "response rejected by UA state machine");
                            false
                        }
                    }
                };
                if needs_retry {
                    if let Err(err) =
                        CcInner::originate_client_invite(&cc, leg, &transaction_manager).await
                    {
                        warn!(cc_id = cc.id, error = %err, "authenticated retry failed to originate");
                    }
                }
            }
        });
    }

    /// Moves both legs toward `Disconnected`. Idempotent: repeated calls
    /// observe the same terminal state and never re-emit BYE/CANCEL once
    /// a leg is already terminal.
    pub async fn disconnect(&self, rtime: Option<SystemTime>) {
        let mut state = self.state.lock().await;
        let now = rtime.unwrap_or_else(SystemTime::now);
        for leg in [CallLeg::A, CallLeg::B] {
            let ua = state.peer_mut(leg);
            if ua.state.is_terminal() {
                continue;
            }
            ua.set_disconnect_ts_clamped(now);
            crate::ua::state::mark_disconnected(ua);
            info!(cc_id = self.id, ?leg, "leg disconnected");
        }
        drop(state);
        self.account_if_terminal(DisconnectReason::Normal).await;
    }

    pub async fn is_terminal(&self) -> bool {
        let state = self.state.lock().await;
        state.ua_a.state.is_terminal() && state.ua_b.state.is_terminal()
    }

    /// `"<a-state> / <b-state>"`, used by the call map's debug-mode GC
    /// dump.
    pub async fn leg_state_summary(&self) -> String {
        let state = self.state.lock().await;
        format!(
            "{} / {}",
            state.ua_a.state_label(),
            state.ua_b.state_label()
        )
    }

    /// Emits a CDR through the AAA engine the first time both legs have
    /// gone terminal. `accounted` guards against the fan-in of both legs
    /// independently reaching terminal state producing two records for
    /// one call.
    async fn account_if_terminal(&self, reason: DisconnectReason) {
        if !self.is_terminal().await {
            return;
        }
        if self
            .accounted
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let record = {
            let state = self.state.lock().await;
            CallDetailRecord {
                cc_id: self.id,
                call_id: self.call_id.clone(),
                caller: state.ua_a.dialog.local_tag.clone(),
                callee: state.ua_b.dialog.local_tag.clone(),
                start_time: system_time_to_utc(self.created_at),
                answer_time: state.ua_b.connect_ts.map(system_time_to_utc),
                end_time: state
                    .ua_a
                    .disconnect_ts
                    .or(state.ua_b.disconnect_ts)
                    .map(system_time_to_utc),
                duration_seconds: 0,
                disconnect_reason: reason,
            }
        };
        let duration = record.duration();
        self.aaa
            .account(CallDetailRecord {
                duration_seconds: duration,
                ..record
            })
            .await;
    }
}

impl CcState {
    fn peer(&self, leg: CallLeg) -> &Ua {
        match leg {
            CallLeg::A => &self.ua_a,
            CallLeg::B => &self.ua_b,
        }
    }

    fn peer_mut(&mut self, leg: CallLeg) -> &mut Ua {
        match leg {
            CallLeg::A => &mut self.ua_a,
            CallLeg::B => &mut self.ua_b,
        }
    }
}

fn system_time_to_utc(ts: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(ts)
}

/// Builds the outbound INVITE for `leg`'s client transaction. Carries
/// whatever offer the peer leg is holding, the configured pass-through
/// headers, and -- on an authenticated retry -- a digest `Authorization`
/// derived from the AAA engine's challenge.
async fn build_outbound_invite(
    cc: &Arc<CcInner>,
    leg: CallLeg,
    offer: Option<Vec<u8>>,
    pass_through_headers: &[(String, String)],
    auth_retried: bool,
) -> SipRequest {
    let local_tag = {
        let state = cc.state.lock().await;
        state.peer(leg).dialog.local_tag.clone()
    };

    let mut headers: Vec<rsip::Header> = vec![
        rsip::Header::CallId(cc.call_id.clone().into()),
        rsip::Header::From(format!("<sip:b2bua@local>;tag={}", local_tag).into()),
        rsip::Header::To("<sip:callee@remote>".into()),
    ];
    for (name, value) in pass_through_headers {
        headers.push(rsip::Header::Other(name.clone(), value.clone()));
    }
    if auth_retried {
        if let AuthDecision::Challenge { realm, nonce } =
            cc.aaa.authorize(Some("b2bua"), None).await
        {
            headers.push(rsip::Header::Authorization(
                format!(
                    "Digest username=\"b2bua\", realm=\"{}\", nonce=\"{}\", uri=\"sip:callee@remote\", response=\"\"",
                    realm, nonce
                )
                .into(),
            ));
        }
    }

    rsip::Request {
        method: rsip::Method::Invite,
        uri: "sip:callee@remote".try_into().expect("static URI parses"),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: offer.unwrap_or_default(),
    }
    .into()
}

fn status_code(code: u16) -> rsip::StatusCode {
    rsip::StatusCode::from(code)
}

fn provisional_response(code: u16) -> SipResponse {
    rsip::Response {
        status_code: status_code(code),
        version: rsip::Version::V2,
        headers: Default::default(),
        body: Default::default(),
    }
    .into()
}

fn final_response(code: u16, body: Option<Vec<u8>>) -> SipResponse {
    rsip::Response {
        status_code: status_code(code),
        version: rsip::Version::V2,
        headers: Default::default(),
        body: body.unwrap_or_default(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aaa::StaticAaaEngine;
    use crate::config::AaaConfig;
    use crate::sip::transaction::memory::InMemoryTransactionManager;

    fn transaction_manager() -> Arc<dyn TransactionManager> {
        Arc::new(InMemoryTransactionManager::default())
    }

    fn aaa_engine() -> Arc<dyn AaaEngine> {
        Arc::new(StaticAaaEngine::new(AaaConfig {
            require_auth: false,
            digest_auth_only: false,
            realm: "b2bua.local".to_string(),
            credentials: Default::default(),
        }))
    }

    fn default_timers() -> UaTimers {
        UaTimers {
            expire_timeout: Duration::from_secs(32),
            no_progress_timeout: Duration::from_secs(8),
            credit_time: None,
            reinvite_interval: None,
        }
    }

    fn new_cc(id: u64, call_id: &str) -> Cc {
        CcInner::new(
            id,
            call_id.to_string(),
            false,
            vec![],
            transaction_manager(),
            aaa_engine(),
            default_timers(),
        )
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let cc = new_cc(1, "call-1");
        cc.disconnect(None).await;
        assert!(cc.is_terminal().await);
        // Second call must not panic or change the outcome.
        cc.disconnect(None).await;
        assert!(cc.is_terminal().await);
    }

    #[tokio::test]
    async fn leg_state_summary_reports_both_legs() {
        let cc = new_cc(2, "call-2");
        let summary = cc.leg_state_summary().await;
        assert_eq!(summary, "Idle / Idle");
    }

    #[tokio::test]
    async fn accepting_initial_invite_activates_a_leg_and_originates_b_leg() {
        let cc = new_cc(3, "call-3");
        let request = SipRequest::from(rsip::Request {
            method: rsip::Method::Invite,
            uri: "sip:bob@example.com".try_into().unwrap(),
            version: rsip::Version::V2,
            headers: Default::default(),
            body: b"v=0".to_vec(),
        });
        let (server_txn, _rx) =
            crate::sip::transaction::memory::InMemoryServerTransaction::new(request.clone());
        cc.accept_initial_invite(request, server_txn).await.unwrap();

        // Give the spawned event loop a tick to drain the Try event.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = cc.leg_state_summary().await;
        assert_eq!(summary, "Trying / Trying");
    }
}
