//! Configuration (spec §6, SPEC_FULL §4.10).
//!
//! Env vars take precedence over an optional `config.toml` overlay; both
//! fall back to documented defaults. Mirrors the teacher's
//! `UwbHubConfig::default()` env-parsing idiom in `uwb_hub.rs`.

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
    Basic,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::None
    }
}

impl std::str::FromStr for AuthMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthMode::None),
            "token" => Ok(AuthMode::Token),
            "basic" => Ok(AuthMode::Basic),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_auth: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_host: String,
    pub gateway_port: u16,
    pub local_udp_port: u16,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub debug: bool,
    pub debug_telegram: bool,
    pub ingress: bool,
    pub state_path: String,
    pub http_bind: String,
}

/// Layer shape for the optional `config.toml` overlay. Every field is
/// optional — only values present here override the built-in defaults,
/// and env vars override both.
#[derive(Debug, Default, Deserialize)]
struct FileOverlay {
    gateway_host: Option<String>,
    gateway_port: Option<u16>,
    local_udp_port: Option<u16>,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_prefix: Option<String>,
    auth_mode: Option<String>,
    auth_token: Option<String>,
    auth_username: Option<String>,
    auth_password: Option<String>,
    user_auth: Option<bool>,
    debug: Option<bool>,
    debug_telegram: Option<bool>,
    ingress: Option<bool>,
    state_path: Option<String>,
    http_bind: Option<String>,
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Loads `config.toml` (if present) then applies environment overrides.
    pub fn load() -> Self {
        let overlay = std::fs::read_to_string("config.toml")
            .ok()
            .and_then(|s| toml::from_str::<FileOverlay>(&s).ok())
            .unwrap_or_default();

        let gateway_host = env_str("GATEWAY_HOST")
            .or(overlay.gateway_host)
            .unwrap_or_else(|| "192.168.1.1".to_string());
        let gateway_port = env_parsed("GATEWAY_PORT")
            .or(overlay.gateway_port)
            .unwrap_or(6000);
        let local_udp_port = env_parsed("LOCAL_UDP_PORT")
            .or(overlay.local_udp_port)
            .unwrap_or(6000);

        let mqtt = MqttConfig {
            host: env_str("MQTT_HOST")
                .or(overlay.mqtt_host)
                .unwrap_or_else(|| "localhost".to_string()),
            port: env_parsed("MQTT_PORT").or(overlay.mqtt_port).unwrap_or(1883),
            username: env_str("MQTT_USERNAME").or(overlay.mqtt_username),
            password: env_str("MQTT_PASSWORD").or(overlay.mqtt_password),
            prefix: env_str("MQTT_PREFIX")
                .or(overlay.mqtt_prefix)
                .unwrap_or_else(|| "buspro/".to_string()),
        };

        let auth = AuthConfig {
            mode: env_str("AUTH_MODE")
                .or(overlay.auth_mode)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            token: env_str("AUTH_TOKEN").or(overlay.auth_token),
            username: env_str("AUTH_USERNAME").or(overlay.auth_username),
            password: env_str("AUTH_PASSWORD").or(overlay.auth_password),
            user_auth: env_parsed("USER_AUTH").or(overlay.user_auth).unwrap_or(false),
        };

        Self {
            gateway_host,
            gateway_port,
            local_udp_port,
            mqtt,
            auth,
            debug: env_parsed("DEBUG").or(overlay.debug).unwrap_or(false),
            debug_telegram: env_parsed("DEBUG_TELEGRAM")
                .or(overlay.debug_telegram)
                .unwrap_or(false),
            ingress: env_parsed("INGRESS").or(overlay.ingress).unwrap_or(false),
            state_path: env_str("STATE_PATH")
                .or(overlay.state_path)
                .unwrap_or_else(|| "state.json".to_string()),
            http_bind: env_str("HTTP_BIND")
                .or(overlay.http_bind)
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        }
    }
}
