//! Dispatcher: the `OnNewDialog` entry point.
//!
//! Every inbound request the transaction manager hands us passes through
//! here first. Grounded directly on the Go B2BUA's `callMap.OnNewDialog`:
//! to-tag check, INVITE classification with Via-based remote-IP
//! resolution, ACL enforcement, optional digest challenge, pass-through
//! header copying, and CC/UA construction.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use rsip::{Method, Response, StatusCode, Version};
use tracing::{debug, info, warn};

use crate::aaa::{AaaEngine, AuthDecision};
use crate::call_map::CallMap;
use crate::cc::{CcInner, UaTimers};
use crate::config::{B2buaConfig, SipConfig};
use crate::sip::message::{header_field_name, SipRequest, SipResponse};
use crate::sip::transaction::memory::InMemoryServerTransaction;
use crate::sip::transaction::TransactionManager;

pub struct Dispatcher {
    call_map: Arc<CallMap>,
    aaa: Arc<dyn AaaEngine>,
    transaction_manager: Arc<dyn TransactionManager>,
    acl_allow: Vec<IpNet>,
    pass_through_headers: Vec<String>,
    digest_auth_only: bool,
    late_media: bool,
    timers: UaTimers,
}

impl Dispatcher {
    pub fn new(
        call_map: Arc<CallMap>,
        aaa: Arc<dyn AaaEngine>,
        transaction_manager: Arc<dyn TransactionManager>,
        sip_config: &SipConfig,
        b2bua_config: &B2buaConfig,
        digest_auth_only: bool,
    ) -> Self {
        let acl_allow = sip_config
            .acl_allow
            .iter()
            .filter_map(|s| IpNet::from_str(s).ok())
            .collect();
        let timers = UaTimers {
            expire_timeout: Duration::from_secs(b2bua_config.expire_timeout_secs as u64),
            no_progress_timeout: Duration::from_secs(b2bua_config.no_progress_timeout_secs as u64),
            credit_time: (b2bua_config.credit_time_secs > 0)
                .then(|| Duration::from_secs(b2bua_config.credit_time_secs as u64)),
            reinvite_interval: (b2bua_config.session_refresh_secs > 0)
                .then(|| Duration::from_secs(b2bua_config.session_refresh_secs as u64)),
        };
        Self {
            call_map,
            aaa,
            transaction_manager,
            acl_allow,
            pass_through_headers: sip_config.pass_through_headers.clone(),
            digest_auth_only,
            late_media: b2bua_config.late_media,
            timers,
        }
    }

    fn ip_allowed(&self, addr: IpAddr) -> bool {
        self.acl_allow.is_empty() || self.acl_allow.iter().any(|net| net.contains(&addr))
    }

    /// Dispatches one inbound request. Returns an immediate response when
    /// the request is rejected or otherwise fully handled here; returns
    /// `None` when a new CC now owns it.
    pub async fn on_new_dialog(&self, request: SipRequest) -> Option<SipResponse> {
        if request.has_to_tag() {
            return Some(respond(StatusCode::CallTransactionDoesNotExist));
        }

        match *request.method() {
            Method::Invite => self.handle_invite(request).await,
            Method::Register | Method::Subscribe => {
                warn!("stateful proxy delegation not configured; rejecting {:?}", request.method());
                Some(respond(StatusCode::NotImplemented))
            }
            _ if is_ping_like(&request) => Some(respond(StatusCode::OK)),
            _ => Some(respond(StatusCode::NotImplemented)),
        }
    }

    async fn handle_invite(&self, request: SipRequest) -> Option<SipResponse> {
        let remote_addr = match request.via_remote_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("cannot resolve remote address: {}", e);
                return Some(respond(StatusCode::BadRequest));
            }
        };

        if let Ok(ip) = remote_addr.parse::<IpAddr>() {
            if !self.ip_allowed(ip) {
                info!(remote_addr = %remote_addr, "INVITE rejected by ACL");
                return Some(respond(StatusCode::Forbidden));
            }
        }

        if !self.call_map.accepting_new_dialogs() {
            info!("safe restart armed, rejecting new dialog");
            return Some(respond(StatusCode::ServiceUnavailable));
        }

        if self.digest_auth_only {
            let decision = self.aaa.authorize(None, None).await;
            if let AuthDecision::Challenge { realm, .. } = decision {
                info!(realm = %realm, "challenging INVITE with digest auth");
                return Some(challenge_response(&realm));
            }
        }

        let pass_through = self.collect_pass_through_headers(&request);

        let cc_id = self.call_map.next_cc_id().await;
        let call_id = request.call_id().unwrap_or_else(|_| format!("unknown-{}", cc_id));
        let cc = CcInner::new(
            cc_id,
            call_id,
            self.late_media,
            pass_through,
            self.transaction_manager.clone(),
            self.aaa.clone(),
            self.timers,
        );

        let (server_txn, mut sent_rx) = InMemoryServerTransaction::new(request.clone());
        if let Err(err) = cc.accept_initial_invite(request, server_txn).await {
            warn!(cc_id, error = %err, "failed to hand inbound INVITE to A-leg UA");
            return Some(respond(StatusCode::ServerInternalError));
        }

        // Stands in for a real transport write until one is plugged in;
        // what matters here is that the A-leg's responses actually flow
        // somewhere observable rather than vanishing.
        tokio::spawn(async move {
            while let Some(response) = sent_rx.recv().await {
                debug_sent_response(cc_id, &response);
            }
        });

        self.call_map.insert(cc);
        info!(cc_id, "new call controller created for inbound INVITE");
        None
    }

    fn collect_pass_through_headers(&self, request: &SipRequest) -> Vec<(String, String)> {
        let mut found = HashMap::new();
        for name in &self.pass_through_headers {
            if let Some(value) = find_header_value(request, name) {
                found.insert(name.clone(), value);
            }
        }
        found.into_iter().collect()
    }
}

fn find_header_value(request: &SipRequest, name: &str) -> Option<String> {
    request
        .0
        .headers
        .iter()
        .find(|h| header_field_name(h).eq_ignore_ascii_case(name))
        .map(|h| h.to_string())
}

fn debug_sent_response(cc_id: u64, response: &SipResponse) {
    debug!(cc_id, status = response.status_code_u16(), "A-leg response ready for transport");
}

fn is_ping_like(request: &SipRequest) -> bool {
    matches!(*request.method(), Method::Notify) || request.0.method.to_string().eq_ignore_ascii_case("PING")
}

fn respond(status: StatusCode) -> SipResponse {
    SipResponse::from(Response {
        status_code: status,
        version: Version::V2,
        headers: Default::default(),
        body: Default::default(),
    })
}

fn challenge_response(realm: &str) -> SipResponse {
    let mut resp = Response {
        status_code: StatusCode::Unauthorized,
        version: Version::V2,
        headers: Default::default(),
        body: Default::default(),
    };
    resp.headers.push(rsip::Header::WwwAuthenticate(
        format!("Digest realm=\"{}\", nonce=\"{}\"", realm, uuid::Uuid::new_v4()).into(),
    ));
    SipResponse::from(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aaa::StaticAaaEngine;
    use crate::config::AaaConfig;
    use crate::sip::transaction::memory::InMemoryTransactionManager;
    use rsip::headers::{CallId, From as FromHeader, To as ToHeader};
    use rsip::{Header, Request};
    use std::time::Duration;

    fn invite_from(via_host: &str) -> SipRequest {
        SipRequest::from(Request {
            method: Method::Invite,
            uri: "sip:bob@example.com".try_into().unwrap(),
            version: Version::V2,
            headers: vec![
                Header::From(FromHeader::from("<sip:alice@example.com>;tag=abc")),
                Header::To(ToHeader::from("<sip:bob@example.com>")),
                Header::CallId(CallId::from("call-1@example.com")),
                Header::Via(format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK1", via_host).into()),
            ]
            .into(),
            body: Default::default(),
        })
    }

    async fn dispatcher_with_acl(acl: Vec<String>) -> Dispatcher {
        let transaction_manager = Arc::new(InMemoryTransactionManager::default());
        let call_map = CallMap::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            transaction_manager.clone(),
        );
        let aaa = Arc::new(StaticAaaEngine::new(AaaConfig {
            require_auth: false,
            digest_auth_only: false,
            realm: "b2bua.local".to_string(),
            credentials: Default::default(),
        }));
        let sip_config = SipConfig {
            acl_allow: acl,
            ..SipConfig::default()
        };
        let b2bua_config = crate::config::B2buaConfig::default();
        Dispatcher::new(
            call_map,
            aaa,
            transaction_manager,
            &sip_config,
            &b2bua_config,
            false,
        )
    }

    #[tokio::test]
    async fn invite_from_disallowed_source_is_rejected_with_no_cc_created() {
        let dispatcher = dispatcher_with_acl(vec!["10.0.0.0/24".to_string()]).await;
        let response = dispatcher.on_new_dialog(invite_from("192.168.1.5")).await;
        assert_eq!(response.unwrap().status_code_u16(), 403);
        assert_eq!(dispatcher.call_map.len(), 0);
    }

    #[tokio::test]
    async fn invite_from_allowed_source_creates_a_cc() {
        let dispatcher = dispatcher_with_acl(vec![]).await;
        let response = dispatcher.on_new_dialog(invite_from("10.0.0.5")).await;
        assert!(response.is_none());
        assert_eq!(dispatcher.call_map.len(), 1);

        let cc = dispatcher.call_map.get(0).expect("cc was inserted");
        // The A-leg UA must actually have received the INVITE, not just
        // have a CC allocated around it.
        assert_ne!(cc.leg_state_summary().await, "Idle / Idle");
    }

    #[tokio::test]
    async fn mid_dialog_request_without_matching_cc_gets_481() {
        let dispatcher = dispatcher_with_acl(vec![]).await;
        let mut req = invite_from("10.0.0.5");
        req.0.headers = req
            .0
            .headers
            .into_iter()
            .map(|h| match h {
                Header::To(_) => Header::To(ToHeader::from("<sip:bob@example.com>;tag=xyz")),
                other => other,
            })
            .collect();
        let response = dispatcher.on_new_dialog(req).await.unwrap();
        assert_eq!(response.status_code_u16(), 481);
    }
}
