//! AAA (authentication/authorization/accounting) seam.
//!
//! The real backend is RADIUS or equivalent and lives entirely outside
//! this crate; what's specified here is the contract the dispatcher and
//! UA authentication retry path call through, plus a static in-memory
//! implementation backed by a config-driven credential table that
//! stands in for a full billing backend.

use async_trait::async_trait;

use crate::cdr::CallDetailRecord;
use crate::config::AaaConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny { code: u16, reason: String },
    Challenge { realm: String, nonce: String },
}

#[async_trait]
pub trait AaaEngine: Send + Sync {
    async fn authorize(&self, username: Option<&str>, credential: Option<&str>) -> AuthDecision;

    async fn account(&self, record: CallDetailRecord);
}

/// Static credential table backing authorization, matching the shape of
/// `AaaConfig::credentials`. `account` only logs; a real deployment wires
/// this to the same CDR pipeline `cdr::CallDetailRecord` already models.
pub struct StaticAaaEngine {
    config: AaaConfig,
}

impl StaticAaaEngine {
    pub fn new(config: AaaConfig) -> Self {
        Self { config }
    }

    fn nonce_for(&self, username: &str) -> String {
        // A real challenge nonce must be unpredictable and single-use;
        // this stand-in only needs to be unique enough for the one-retry
        // rule to exercise correctly in tests.
        format!("{}-{}", self.config.realm, username)
    }
}

#[async_trait]
impl AaaEngine for StaticAaaEngine {
    async fn authorize(&self, username: Option<&str>, credential: Option<&str>) -> AuthDecision {
        if !self.config.require_auth {
            return AuthDecision::Allow;
        }
        let Some(username) = username else {
            return AuthDecision::Challenge {
                realm: self.config.realm.clone(),
                nonce: "anonymous".to_string(),
            };
        };
        match (self.config.credentials.get(username), credential) {
            (Some(expected), Some(supplied)) if expected == supplied => AuthDecision::Allow,
            (Some(_), None) => AuthDecision::Challenge {
                realm: self.config.realm.clone(),
                nonce: self.nonce_for(username),
            },
            _ => AuthDecision::Deny {
                code: 403,
                reason: "Forbidden".to_string(),
            },
        }
    }

    async fn account(&self, record: CallDetailRecord) {
        tracing::info!(call_id = %record.call_id, duration = record.duration_seconds, "call accounted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with_user(digest_only: bool) -> AaaConfig {
        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "secret".to_string());
        AaaConfig {
            require_auth: true,
            digest_auth_only: digest_only,
            realm: "b2bua.local".to_string(),
            credentials,
        }
    }

    #[tokio::test]
    async fn auth_disabled_always_allows() {
        let engine = StaticAaaEngine::new(AaaConfig {
            require_auth: false,
            ..config_with_user(false)
        });
        assert_eq!(engine.authorize(None, None).await, AuthDecision::Allow);
    }

    #[tokio::test]
    async fn known_user_with_matching_credential_is_allowed() {
        let engine = StaticAaaEngine::new(config_with_user(false));
        assert_eq!(
            engine.authorize(Some("alice"), Some("secret")).await,
            AuthDecision::Allow
        );
    }

    #[tokio::test]
    async fn known_user_without_credential_is_challenged() {
        let engine = StaticAaaEngine::new(config_with_user(true));
        match engine.authorize(Some("alice"), None).await {
            AuthDecision::Challenge { .. } => {}
            other => panic!("expected Challenge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_user_is_denied() {
        let engine = StaticAaaEngine::new(config_with_user(false));
        match engine.authorize(Some("mallory"), Some("x")).await {
            AuthDecision::Deny { code: 403, .. } => {}
            other => panic!("expected Deny(403), got {:?}", other),
        }
    }
}
