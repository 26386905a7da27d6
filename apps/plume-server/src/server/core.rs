use std::{sync::Arc, time::Duration};

use super::{
    expiry::Expiry, member_cache::MemberCachePolicy, orchestrator::OrchestratorConfig,
    pipeline::ProxyPipeline,
};

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = plume_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RELAY_API_URL: &str = "http://127.0.0.1:8081/api";
pub const DEFAULT_RELAY_NAME: &str = "plume";
pub const DEFAULT_RELAY_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_ORIGIN_DELETE_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;
pub const DEFAULT_DISPLAY_NAME_MIN_CHARS: usize = 2;
pub const DEFAULT_DISPLAY_NAME_MAX_CHARS: usize = 32;
pub const DEFAULT_WARNING_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_LANE_CAPACITY: usize = 64;
pub const DEFAULT_LANE_IDLE_SECS: u64 = 60;

pub const DEFAULT_CANDIDATES_EXPIRY: Expiry =
    Expiry::new(Duration::from_secs(60), Duration::from_secs(60 * 60));
pub const DEFAULT_NO_SYSTEM_EXPIRY: Expiry =
    Expiry::new(Duration::from_secs(5 * 60), Duration::from_secs(15 * 60));
pub const DEFAULT_GUILD_SETTINGS_EXPIRY: Expiry =
    Expiry::new(Duration::from_secs(60), Duration::from_secs(5 * 60));
pub const DEFAULT_RELAY_EXPIRY: Expiry =
    Expiry::new(Duration::from_secs(6 * 60 * 60), Duration::from_secs(24 * 60 * 60));

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub database_url: Option<String>,
    pub relay_api_url: String,
    pub relay_token: String,
    pub relay_name: String,
    pub relay_request_timeout: Duration,
    pub application_id: u64,
    pub origin_delete_delay: Duration,
    pub maintenance_interval: Duration,
    pub max_attachment_bytes: u64,
    pub display_name_min_chars: usize,
    pub display_name_max_chars: usize,
    pub warning_interval: Duration,
    pub lane_capacity: usize,
    pub lane_idle_timeout: Duration,
    pub candidates_expiry: Expiry,
    pub no_system_expiry: Expiry,
    pub guild_settings_expiry: Expiry,
    pub relay_expiry: Expiry,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            database_url: None,
            relay_api_url: String::from(DEFAULT_RELAY_API_URL),
            relay_token: String::new(),
            relay_name: String::from(DEFAULT_RELAY_NAME),
            relay_request_timeout: Duration::from_secs(DEFAULT_RELAY_REQUEST_TIMEOUT_SECS),
            application_id: 0,
            origin_delete_delay: Duration::from_millis(DEFAULT_ORIGIN_DELETE_DELAY_MILLIS),
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            display_name_min_chars: DEFAULT_DISPLAY_NAME_MIN_CHARS,
            display_name_max_chars: DEFAULT_DISPLAY_NAME_MAX_CHARS,
            warning_interval: Duration::from_secs(DEFAULT_WARNING_INTERVAL_SECS),
            lane_capacity: DEFAULT_LANE_CAPACITY,
            lane_idle_timeout: Duration::from_secs(DEFAULT_LANE_IDLE_SECS),
            candidates_expiry: DEFAULT_CANDIDATES_EXPIRY,
            no_system_expiry: DEFAULT_NO_SYSTEM_EXPIRY,
            guild_settings_expiry: DEFAULT_GUILD_SETTINGS_EXPIRY,
            relay_expiry: DEFAULT_RELAY_EXPIRY,
        }
    }
}

impl AppConfig {
    pub(crate) fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            relay_name: self.relay_name.clone(),
            application_id: self.application_id,
            cache_policy: MemberCachePolicy {
                candidates: self.candidates_expiry,
                no_system: self.no_system_expiry,
                guild_settings: self.guild_settings_expiry,
            },
            relay_expiry: self.relay_expiry,
            display_name_min_chars: self.display_name_min_chars,
            display_name_max_chars: self.display_name_max_chars,
            max_attachment_bytes: self.max_attachment_bytes,
            origin_delete_delay: self.origin_delete_delay,
            warning_interval: self.warning_interval,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) pipeline: Arc<ProxyPipeline>,
}

impl AppState {
    pub(crate) fn new(pipeline: Arc<ProxyPipeline>) -> Self {
        Self { pipeline }
    }
}
