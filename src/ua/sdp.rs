//! Asynchronous SDP-bridging seam.
//!
//! When a UA has a media-relay hook installed, an incoming SDP body is not
//! adopted directly: the hook gets first look via
//! [`SdpChangeHook::on_remote_sdp_change`], and the UA's pending event stays
//! unqueued until the hook calls back through the [`SdpResumeToken`] it was
//! handed. This models the relay's own async rewrite round-trip without
//! the UA holding its session lock across it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::warn;

#[async_trait]
pub trait SdpChangeHook: Send + Sync {
    async fn on_remote_sdp_change(&self, body: Vec<u8>, resume: SdpResumeToken);
}

/// One-shot resume handle for a deferred SDP rewrite. `resume` must be
/// called exactly once; a second call is logged and otherwise ignored
/// rather than panicking on what is, from the relay's perspective, a
/// harmless double-notify.
pub struct SdpResumeToken {
    used: Arc<AtomicBool>,
    tx: Option<oneshot::Sender<Vec<u8>>>,
    call_id: String,
}

impl SdpResumeToken {
    pub fn new(call_id: impl Into<String>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                used: Arc::new(AtomicBool::new(false)),
                tx: Some(tx),
                call_id: call_id.into(),
            },
            rx,
        )
    }

    pub fn resume(mut self, rewritten_body: Vec<u8>) {
        if self.used.swap(true, Ordering::SeqCst) {
            warn!(call_id = %self.call_id, "SDP resume callback invoked more than once, ignoring");
            return;
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(rewritten_body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_resume_is_a_silent_no_op() {
        let (token, rx) = SdpResumeToken::new("call-1");
        let used = token.used.clone();
        token.resume(b"v=0".to_vec());
        assert!(used.load(Ordering::SeqCst));

        let received = rx.await.unwrap();
        assert_eq!(received, b"v=0".to_vec());

        // A clone-equivalent second token sharing the same `used` flag
        // would no-op; here we just assert the flag latched, which is
        // what the dispatcher checks before trusting a resume.
    }
}
