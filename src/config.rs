//! Configuration management for the B2BUA

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub b2bua: B2buaConfig,
    pub aaa: AaaConfig,
    pub call_map: CallMapConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    pub max_concurrent_calls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub domain: String,
    /// Source addresses/CIDRs allowed to originate new dialogs. Empty = allow all.
    pub acl_allow: Vec<String>,
    /// Header names copied verbatim from the inbound INVITE to the outbound one.
    pub pass_through_headers: Vec<String>,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 5060,
            domain: "b2bua.local".to_string(),
            acl_allow: vec![],
            pass_through_headers: vec!["P-Asserted-Identity".to_string(), "Diversion".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct B2buaConfig {
    /// INVITE-not-answered timeout, in seconds (the `expire` timer).
    pub expire_timeout_secs: u32,
    /// No 1xx received within this many seconds is itself a failure.
    pub no_progress_timeout_secs: u32,
    /// Call duration budget in seconds; 0 = unlimited (the `credit` timer).
    pub credit_time_secs: u32,
    /// RFC 4028 session-refresh interval in seconds; 0 = disabled.
    pub session_refresh_secs: u32,
    pub late_media: bool,
    pub default_route_gateway: Option<String>,
    pub routing_table: Vec<RoutingRule>,
}

impl Default for B2buaConfig {
    fn default() -> Self {
        Self {
            expire_timeout_secs: 32,
            no_progress_timeout_secs: 8,
            credit_time_secs: 0,
            session_refresh_secs: 1800,
            late_media: false,
            default_route_gateway: None,
            routing_table: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub pattern: String,
    pub target: String,
    pub translation: Option<NumberTranslation>,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberTranslation {
    pub prefix_strip: Option<String>,
    pub prefix_add: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AaaConfig {
    pub require_auth: bool,
    /// Challenge with WWW-Authenticate on first INVITE even without a
    /// prior Authorization header (digest-only mode).
    pub digest_auth_only: bool,
    pub realm: String,
    /// Stand-in for the external RADIUS/AAA backend: a static credential table.
    pub credentials: std::collections::HashMap<String, String>,
}

impl Default for AaaConfig {
    fn default() -> Self {
        Self {
            require_auth: false,
            digest_auth_only: false,
            realm: "b2bua.local".to_string(),
            credentials: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMapConfig {
    pub gc_interval_secs: u64,
    pub fast_gc_interval_secs: u64,
}

impl Default for CallMapConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: 60,
            fast_gc_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl SwitchConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SwitchConfig =
            toml::from_str(&contents).map_err(|e| Error::parse(format!("invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("SWITCH").separator("_"))
            .build()?;
        let config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.max_concurrent_calls == 0 {
            return Err(Error::parse("max_concurrent_calls must be greater than zero"));
        }
        if self.call_map.gc_interval_secs == 0 {
            return Err(Error::parse("call_map.gc_interval_secs must be greater than zero"));
        }
        for rule in &self.b2bua.routing_table {
            if rule.pattern.is_empty() {
                return Err(Error::parse("routing rule pattern must not be empty"));
            }
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "b2bua-1".to_string(),
                description: "SIP back-to-back user agent".to_string(),
                max_concurrent_calls: 1000,
            },
            sip: SipConfig::default(),
            b2bua: B2buaConfig::default(),
            aaa: AaaConfig::default(),
            call_map: CallMapConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = SwitchConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrent_calls_rejected() {
        let mut config = SwitchConfig::default_config();
        config.general.max_concurrent_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = SwitchConfig::default_config();
        let toml_text = toml::to_string_pretty(&config).unwrap();
        let parsed: SwitchConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.general.node_id, config.general.node_id);
        assert_eq!(parsed.sip.listen_port, config.sip.listen_port);
    }
}
