use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote cache; absent url keeps the process-local backend
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Upper bounds keep `Instant + Duration` arithmetic far from overflow.
const MAX_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_WINDOW_SECS: u64 = 24 * 60 * 60;
const MAX_UPSTREAM_SECS: u64 = 60 * 60;

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "logging.level must be one of {}",
                LOG_LEVELS.join(", ")
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err("rate_limit.max_requests must be > 0".into());
        }
        if !(1..=MAX_WINDOW_SECS).contains(&self.rate_limit.window_secs) {
            return Err(format!(
                "rate_limit.window_secs must be between 1 and {MAX_WINDOW_SECS}"
            ));
        }
        if !(1..=MAX_WINDOW_SECS).contains(&self.rate_limit.sweep_interval_secs) {
            return Err(format!(
                "rate_limit.sweep_interval_secs must be between 1 and {MAX_WINDOW_SECS}"
            ));
        }
        for (endpoint, policy) in &self.rate_limit.endpoints {
            if policy.max_requests == 0 || !(1..=MAX_WINDOW_SECS).contains(&policy.window_secs) {
                return Err(format!(
                    "rate_limit.endpoints.\"{endpoint}\" needs a non-zero limit and a window of at most {MAX_WINDOW_SECS}s"
                ));
            }
        }
        for ttl in [self.cache.default_ttl_secs, self.cache.combined_ttl_secs] {
            if !(1..=MAX_TTL_SECS).contains(&ttl) {
                return Err(format!("cache TTLs must be between 1 and {MAX_TTL_SECS}"));
            }
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err("upstream.base_url must not be empty".into());
        }
        if self.upstream.request_timeout_secs == 0 {
            return Err("upstream.request_timeout_secs must be > 0".into());
        }
        if self.upstream.request_deadline_secs > MAX_UPSTREAM_SECS {
            return Err(format!(
                "upstream.request_deadline_secs must be at most {MAX_UPSTREAM_SECS}"
            ));
        }
        let target = self.upstream.attendance_target_percent;
        if target == 0.0 || !(0.0..=100.0).contains(&target) {
            return Err("upstream.attendance_target_percent must be in (0, 100]".into());
        }
        if self.upstream.request_deadline_secs < self.upstream.request_timeout_secs {
            return Err(
                "upstream.request_deadline_secs must be >= upstream.request_timeout_secs".into(),
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::from((ip, self.server.port))
    }

    pub fn is_production(&self) -> bool {
        self.server.environment.eq_ignore_ascii_case("production")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Deployment tag: development, staging or production
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Allowed CORS origins. Empty or `*` is permissive.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_body_limit() -> usize {
    64 * 1024
}
fn default_environment() -> String {
    "development".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            environment: default_environment(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connect, wait and recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    2000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Leading segment of every cache key
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,

    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// TTL of the merged `/data` result
    #[serde(default = "default_ttl_secs")]
    pub combined_ttl_secs: u64,
}

fn default_cache_namespace() -> String {
    "campus-relay".into()
}

fn default_ttl_secs() -> u64 {
    300
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn combined_ttl(&self) -> Duration {
        Duration::from_secs(self.combined_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_cache_namespace(),
            default_ttl_secs: default_ttl_secs(),
            combined_ttl_secs: default_ttl_secs(),
        }
    }
}

/// One sliding-window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl WindowPolicy {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Reserved for a steady+burst scheme. Not consulted by the sliding window.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Stricter windows keyed by request path
    #[serde(default = "default_endpoint_policies")]
    pub endpoints: BTreeMap<String, WindowPolicy>,

    /// Seconds between sweeps of idle identifiers
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_requests() -> u32 {
    60
}
fn default_window_secs() -> u64 {
    60
}
fn default_burst() -> u32 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_endpoint_policies() -> BTreeMap<String, WindowPolicy> {
    BTreeMap::from([
        ("/data".to_string(), WindowPolicy::new(30, 60)),
        ("/attendance".to_string(), WindowPolicy::new(30, 60)),
        ("/cgpa".to_string(), WindowPolicy::new(20, 60)),
        ("/auto-feedback".to_string(), WindowPolicy::new(5, 300)),
    ])
}

impl RateLimitConfig {
    pub fn default_policy(&self) -> WindowPolicy {
        WindowPolicy::new(self.max_requests, self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            burst: default_burst(),
            endpoints: default_endpoint_policies(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// How one portal login form is filled in and judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginFlowConfig {
    pub login_path: String,
    pub account_field: String,
    pub secret_field: String,
    /// Text whose presence in the post-login page means the credentials were rejected
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
    /// Text that must be present after a successful login, if set
    #[serde(default)]
    pub success_marker: Option<String>,
}

fn default_failure_markers() -> Vec<String> {
    vec!["Invalid".into(), "incorrect".into()]
}

/// A portal page and the id of the table holding its data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageConfig {
    pub path: String,
    pub table_id: String,
}

impl PageConfig {
    fn new(path: &str, table_id: &str) -> Self {
        Self {
            path: path.into(),
            table_id: table_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagesConfig {
    pub attendance: PageConfig,
    pub grade_summary: PageConfig,
    pub exam_schedule: PageConfig,
    pub assessments: PageConfig,
    pub profile: PageConfig,
    /// Form posted by the feedback worker
    pub feedback: PageConfig,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            attendance: PageConfig::new(
                "/studzone2/AttWfPercView.aspx",
                "PDGcourpercView",
            ),
            grade_summary: PageConfig::new("/studzone2/FrmEpsStudResult.aspx", "DgResult"),
            exam_schedule: PageConfig::new("/studzone2/AttWfStudTimtab.aspx", "DtStfTimtab"),
            assessments: PageConfig::new("/studzone2/CAMarks_View.aspx", "8"),
            profile: PageConfig::new("/studzone/Profile", "personal-info"),
            feedback: PageConfig::new("/studzone/Feedback", "feedback"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bound on every single upstream call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bound on a whole fan-out; fetches still running at this point are failed
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Offset used for "today" (combined cache key, birthdays, exam priority)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    /// Attendance percentage the per-course leave budget is computed against
    #[serde(default = "default_attendance_target_percent")]
    pub attendance_target_percent: f64,

    /// Page fetched by the session liveness probe
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    #[serde(default = "default_studzone_login")]
    pub studzone_login: LoginFlowConfig,

    #[serde(default = "default_grades_login")]
    pub grades_login: LoginFlowConfig,

    #[serde(default)]
    pub pages: PagesConfig,
}

fn default_base_url() -> String {
    "https://ecampus.psgtech.ac.in".into()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_request_deadline_secs() -> u64 {
    20
}
fn default_user_agent() -> String {
    concat!("campus-relay/", env!("CARGO_PKG_VERSION")).into()
}
fn default_utc_offset_minutes() -> i32 {
    330
}
fn default_attendance_target_percent() -> f64 {
    75.0
}
fn default_probe_path() -> String {
    "/studzone".into()
}
fn default_studzone_login() -> LoginFlowConfig {
    LoginFlowConfig {
        login_path: "/studzone2/".into(),
        account_field: "rollno".into(),
        secret_field: "pass".into(),
        failure_markers: default_failure_markers(),
        success_marker: None,
    }
}
fn default_grades_login() -> LoginFlowConfig {
    LoginFlowConfig {
        login_path: "/studzone2/".into(),
        account_field: "regno".into(),
        secret_field: "passwd".into(),
        failure_markers: default_failure_markers(),
        success_marker: None,
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            request_deadline_secs: default_request_deadline_secs(),
            user_agent: default_user_agent(),
            utc_offset_minutes: default_utc_offset_minutes(),
            attendance_target_percent: default_attendance_target_percent(),
            probe_path: default_probe_path(),
            studzone_login: default_studzone_login(),
            grades_login: default_grades_login(),
            pages: PagesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Salt expected by the encoded credential payload
    #[serde(default = "default_payload_salt")]
    pub payload_salt: String,
}

fn default_payload_salt() -> String {
    "campus-relay".into()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            payload_salt: default_payload_salt(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "campus-relay.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., CAMPUS_RELAY__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("CAMPUS_RELAY")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.rate_limit.default_policy(), WindowPolicy::new(60, 60));
        assert_eq!(
            cfg.rate_limit.endpoints.get("/auto-feedback"),
            Some(&WindowPolicy::new(5, 300))
        );
        assert!(cfg.redis.url.is_none());
        assert!(!cfg.is_production());
    }

    #[test]
    fn deadline_shorter_than_call_timeout_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.upstream.request_deadline_secs = 5;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("request_deadline_secs"));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "chatty".into();
        assert!(cfg.validate().is_err());
        cfg.logging.level = "DEBUG".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.cache.combined_ttl_secs = u64::MAX;
        assert!(cfg.validate().unwrap_err().contains("cache TTLs"));

        let mut cfg = AppConfig::default();
        cfg.rate_limit.window_secs = u64::MAX;
        assert!(cfg.validate().unwrap_err().contains("window_secs"));

        let mut cfg = AppConfig::default();
        cfg.rate_limit
            .endpoints
            .insert("/cgpa".into(), WindowPolicy::new(20, u64::MAX));
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.upstream.request_deadline_secs = u64::MAX;
        assert!(cfg.validate().unwrap_err().contains("request_deadline_secs"));
    }

    #[test]
    fn attendance_target_must_be_a_percentage() {
        let mut cfg = AppConfig::default();
        cfg.upstream.attendance_target_percent = 120.0;
        assert!(cfg.validate().is_err());
        cfg.upstream.attendance_target_percent = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.upstream.attendance_target_percent = 80.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_endpoint_window_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit
            .endpoints
            .insert("/cgpa".into(), WindowPolicy::new(0, 60));
        assert!(cfg.validate().is_err());
    }
}
