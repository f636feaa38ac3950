//! Transaction-layer seam.
//!
//! The transport and transaction-matching machinery (retransmission
//! timers, branch generation, TCP/UDP framing) is explicitly out of
//! scope: this crate only needs to *drive* transactions, not implement
//! RFC 3261 §17 itself. [`TransactionManager`] is the contract a real
//! transport adapter has to satisfy; [`memory::InMemoryTransactionManager`]
//! is the in-process test double the call-control tests are built on.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::sip::message::{SipRequest, SipResponse};

/// A transaction the B2BUA is the UAS of: it owns the original request and
/// can send zero or more provisional responses followed by exactly one
/// final response.
#[async_trait]
pub trait ServerTransaction: Send + Sync {
    fn request(&self) -> &SipRequest;

    async fn respond(&self, response: SipResponse) -> Result<()>;

    /// True once a final (>=200) response has gone out; sending again is a
    /// caller bug and returns `Error::InvalidState`.
    fn is_completed(&self) -> bool;
}

/// A transaction the B2BUA is the UAC of.
#[async_trait]
pub trait ClientTransaction: Send + Sync {
    fn request(&self) -> &SipRequest;

    /// Sends a CANCEL for this transaction. Only meaningful before a final
    /// response has arrived; RFC 3261 §9.1 makes CANCEL-after-200 a no-op,
    /// which implementations should honor silently rather than error.
    async fn cancel(&self) -> Result<()>;

    /// Marks this transaction as one whose ACK should carry the SDP offer
    /// rather than the original INVITE (late-media / answer-in-2xx).
    fn set_uack(&self, uack: bool);

    fn uack(&self) -> bool;

    /// Sends the ACK for a final response, with an optional body (used for
    /// the late-media case where the offer rides on the ACK instead of the
    /// INVITE).
    async fn send_ack(&self, body: Option<Vec<u8>>) -> Result<()>;
}

/// Starts new transactions and correlates responses back to the call
/// controller. A production adapter wraps a real UDP/TCP/TLS transport and
/// retransmission timers; `InMemoryTransactionManager` below fakes both for
/// tests.
///
/// `responses` is the `response_cb` of the outbound contract: every
/// provisional and final response the manager receives for this
/// transaction is pushed onto it, in order, until the transaction
/// completes.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin_client_transaction(
        &self,
        request: SipRequest,
        responses: mpsc::UnboundedSender<SipResponse>,
    ) -> Result<std::sync::Arc<dyn ClientTransaction>>;
}

pub mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ClientTransaction, ServerTransaction, TransactionManager};
    use crate::error::Result;
    use crate::sip::message::{SipRequest, SipResponse};

    /// In-process stand-in used by tests: "sending" a response or ACK just
    /// pushes it onto a channel the test can drain, and CANCEL flips a flag
    /// rather than racing a real network round trip.
    pub struct InMemoryServerTransaction {
        request: SipRequest,
        completed: AtomicBool,
        sent: mpsc::UnboundedSender<SipResponse>,
    }

    impl InMemoryServerTransaction {
        pub fn new(request: SipRequest) -> (Arc<Self>, mpsc::UnboundedReceiver<SipResponse>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    request,
                    completed: AtomicBool::new(false),
                    sent: tx,
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl ServerTransaction for InMemoryServerTransaction {
        fn request(&self) -> &SipRequest {
            &self.request
        }

        async fn respond(&self, response: SipResponse) -> Result<()> {
            if response.is_provisional() {
                let _ = self.sent.send(response);
                return Ok(());
            }
            if self.completed.swap(true, Ordering::SeqCst) {
                return Err(crate::error::Error::invalid_state(
                    "final response already sent on this transaction",
                ));
            }
            let _ = self.sent.send(response);
            Ok(())
        }

        fn is_completed(&self) -> bool {
            self.completed.load(Ordering::SeqCst)
        }
    }

    pub struct InMemoryClientTransaction {
        request: SipRequest,
        cancelled: AtomicBool,
        uack: AtomicBool,
        acked: Mutex<Option<Option<Vec<u8>>>>,
    }

    impl InMemoryClientTransaction {
        pub fn new(request: SipRequest) -> Arc<Self> {
            Arc::new(Self {
                request,
                cancelled: AtomicBool::new(false),
                uack: AtomicBool::new(false),
                acked: Mutex::new(None),
            })
        }

        pub fn was_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        pub fn ack_body(&self) -> Option<Option<Vec<u8>>> {
            self.acked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClientTransaction for InMemoryClientTransaction {
        fn request(&self) -> &SipRequest {
            &self.request
        }

        async fn cancel(&self) -> Result<()> {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn set_uack(&self, uack: bool) {
            self.uack.store(uack, Ordering::SeqCst);
        }

        fn uack(&self) -> bool {
            self.uack.load(Ordering::SeqCst)
        }

        async fn send_ack(&self, body: Option<Vec<u8>>) -> Result<()> {
            *self.acked.lock().unwrap() = Some(body);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryTransactionManager;

    #[async_trait]
    impl TransactionManager for InMemoryTransactionManager {
        async fn begin_client_transaction(
            &self,
            request: SipRequest,
            _responses: mpsc::UnboundedSender<SipResponse>,
        ) -> Result<Arc<dyn ClientTransaction>> {
            // No real transport to receive responses from; production
            // adapters drive `_responses` from the wire.
            Ok(InMemoryClientTransaction::new(request))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rsip::{Method, Request, Version};

        fn dummy_request() -> SipRequest {
            SipRequest::from(Request {
                method: Method::Invite,
                uri: "sip:bob@example.com".try_into().unwrap(),
                version: Version::V2,
                headers: Default::default(),
                body: Default::default(),
            })
        }

        #[tokio::test]
        async fn second_final_response_is_rejected() {
            let (txn, mut rx) = InMemoryServerTransaction::new(dummy_request());
            let ok = rsip::Response {
                status_code: rsip::StatusCode::OK,
                version: Version::V2,
                headers: Default::default(),
                body: Default::default(),
            };
            txn.respond(SipResponse::from(ok.clone())).await.unwrap();
            assert!(txn.is_completed());
            assert!(txn.respond(SipResponse::from(ok)).await.is_err());
            assert!(rx.try_recv().is_ok());
        }

        #[tokio::test]
        async fn cancel_flips_flag_without_touching_transport() {
            let mgr = InMemoryTransactionManager::default();
            let (tx, _rx) = mpsc::unbounded_channel();
            let txn = mgr.begin_client_transaction(dummy_request(), tx).await.unwrap();
            assert!(txn.cancel().await.is_ok());
        }
    }
}
