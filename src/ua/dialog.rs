//! UA data record: dialog identity, timestamps and the CC back-handle.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cc::CcInner;
use crate::event::{CallLeg, CcEvent};
use crate::sip::transaction::{ClientTransaction, ServerTransaction};
use crate::ua::sdp::SdpChangeHook;
use crate::ua::state::UaStateKind;

/// Which of a UA's four timers elapsed (`Ua::due_timer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Expire,
    NoProgress,
    Credit,
    Reinvite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaRole {
    Uas,
    Uac,
}

/// SIP dialog identity. `remote_tag` is unset until the first response
/// carrying one is observed (UAC) or the first request re-sent with one
/// (UAS); it must then stay immutable for the life of the dialog.
#[derive(Debug, Clone, Default)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl DialogId {
    pub fn is_established(&self) -> bool {
        self.remote_tag.is_some()
    }
}

pub struct Ua {
    pub role: UaRole,
    pub leg: CallLeg,
    pub state: UaStateKind,
    pub dialog: DialogId,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub route_set: Vec<String>,

    pub setup_ts: SystemTime,
    pub p1xx_ts: Option<SystemTime>,
    pub connect_ts: Option<SystemTime>,
    pub disconnect_ts: Option<SystemTime>,
    pub last_provisional_code: Option<u16>,

    pub local_sdp: Option<Vec<u8>>,
    pub remote_sdp: Option<Vec<u8>>,

    pub late_media: bool,
    pub pending_tr: bool,
    pub uas_resp_received: bool,
    pub auth_retried: bool,

    pub client_txn: Option<Arc<dyn ClientTransaction>>,
    pub server_txn: Option<Arc<dyn ServerTransaction>>,
    pub sdp_hook: Option<Arc<dyn SdpChangeHook>>,

    /// Configured durations for the timer set; `None` means the
    /// timer is disabled for this dialog.
    pub expire_timeout: Duration,
    pub no_progress_timeout: Duration,
    pub credit_time: Option<Duration>,
    pub reinvite_interval: Option<Duration>,

    expire_deadline: Option<Instant>,
    no_progress_deadline: Option<Instant>,
    credit_deadline: Option<Instant>,
    reinvite_deadline: Option<Instant>,

    pending_events: VecDeque<CcEvent>,
    cc_events: mpsc::UnboundedSender<(CallLeg, CcEvent)>,
    cc: Weak<CcInner>,
}

impl Ua {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: UaRole,
        leg: CallLeg,
        call_id: String,
        local_tag: String,
        late_media: bool,
        expire_timeout: Duration,
        no_progress_timeout: Duration,
        credit_time: Option<Duration>,
        reinvite_interval: Option<Duration>,
        cc_events: mpsc::UnboundedSender<(CallLeg, CcEvent)>,
        cc: Weak<CcInner>,
    ) -> Self {
        Self {
            role,
            leg,
            state: UaStateKind::Idle,
            dialog: DialogId {
                call_id,
                local_tag,
                remote_tag: None,
            },
            local_cseq: 1,
            remote_cseq: 0,
            route_set: Vec::new(),
            setup_ts: SystemTime::now(),
            p1xx_ts: None,
            connect_ts: None,
            disconnect_ts: None,
            last_provisional_code: None,
            local_sdp: None,
            remote_sdp: None,
            late_media,
            pending_tr: false,
            uas_resp_received: false,
            auth_retried: false,
            client_txn: None,
            server_txn: None,
            sdp_hook: None,
            expire_timeout,
            no_progress_timeout,
            credit_time,
            reinvite_interval,
            expire_deadline: None,
            no_progress_deadline: None,
            credit_deadline: None,
            reinvite_deadline: None,
            pending_events: VecDeque::new(),
            cc_events,
            cc,
        }
    }

    pub fn arm_expire(&mut self) {
        self.expire_deadline = Some(Instant::now() + self.expire_timeout);
    }

    pub fn cancel_expire(&mut self) {
        self.expire_deadline = None;
    }

    pub fn arm_no_progress(&mut self) {
        self.no_progress_deadline = Some(Instant::now() + self.no_progress_timeout);
    }

    pub fn cancel_no_progress(&mut self) {
        self.no_progress_deadline = None;
    }

    pub fn arm_credit(&mut self) {
        self.credit_deadline = self.credit_time.map(|d| Instant::now() + d);
    }

    pub fn cancel_credit(&mut self) {
        self.credit_deadline = None;
    }

    pub fn arm_reinvite(&mut self) {
        self.reinvite_deadline = self.reinvite_interval.map(|d| Instant::now() + d);
    }

    pub fn cancel_reinvite(&mut self) {
        self.reinvite_deadline = None;
    }

    pub fn cancel_all_timers(&mut self) {
        self.expire_deadline = None;
        self.no_progress_deadline = None;
        self.credit_deadline = None;
        self.reinvite_deadline = None;
    }

    /// Pops and returns the first timer found past due, if any, so the
    /// caller can drive the matching state transition. Checked in a fixed
    /// order; coalescing more than one fired timer into a single poll is
    /// fine, since the caller just drives whichever it gets one at a time.
    pub fn due_timer(&mut self, now: Instant) -> Option<TimerKind> {
        if self.expire_deadline.is_some_and(|d| now >= d) {
            self.expire_deadline = None;
            return Some(TimerKind::Expire);
        }
        if self.no_progress_deadline.is_some_and(|d| now >= d) {
            self.no_progress_deadline = None;
            return Some(TimerKind::NoProgress);
        }
        if self.credit_deadline.is_some_and(|d| now >= d) {
            self.credit_deadline = None;
            return Some(TimerKind::Credit);
        }
        if self.reinvite_deadline.is_some_and(|d| now >= d) {
            self.reinvite_deadline = None;
            return Some(TimerKind::Reinvite);
        }
        None
    }

    /// Posts an event both to the local pending queue (for inspection /
    /// tests) and across the channel to the owning CC's translation loop.
    pub fn enqueue(&mut self, event: CcEvent) {
        self.pending_events.push_back(event.clone());
        let _ = self.cc_events.send((self.leg, event));
    }

    pub fn drain_pending(&mut self) -> Vec<CcEvent> {
        self.pending_events.drain(..).collect()
    }

    pub fn pending_events(&self) -> &VecDeque<CcEvent> {
        &self.pending_events
    }

    pub fn cc(&self) -> Option<Arc<CcInner>> {
        self.cc.upgrade()
    }

    /// Clamp rule: `disconnect_ts` never precedes `setup_ts`.
    pub fn set_disconnect_ts_clamped(&mut self, ts: SystemTime) {
        let clamped = if ts < self.setup_ts { self.setup_ts } else { ts };
        self.disconnect_ts = Some(clamped);
    }

    pub fn state_label(&self) -> &'static str {
        self.state.label()
    }
}

impl std::fmt::Debug for Ua {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ua")
            .field("role", &self.role)
            .field("leg", &self.leg)
            .field("state", &self.state.label())
            .field("call_id", &self.dialog.call_id)
            .finish()
    }
}
