//! Domain records shared by the scheduler, the incident engine and the stores

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MonitorId = Uuid;
pub type IncidentId = Uuid;

/// User ids are issued by the external auth layer and are opaque to us
pub type UserId = String;

/// Error returned when a stored enum value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(ParseEnumError::new("http method", s)),
        }
    }
}

/// Monitor-level status as shown to users
///
/// `Paused` is only ever set by the CRUD layer; probe outcomes move a
/// monitor between `Up` and `Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorStatus {
    Up,
    Down,
    Paused,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Up => "UP",
            MonitorStatus::Down => "DOWN",
            MonitorStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(MonitorStatus::Up),
            "DOWN" => Ok(MonitorStatus::Down),
            "PAUSED" => Ok(MonitorStatus::Paused),
            _ => Err(ParseEnumError::new("monitor status", s)),
        }
    }
}

/// A configured endpoint that is checked periodically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: MonitorId,

    /// Owning user
    pub user_id: UserId,

    pub url: String,

    pub method: HttpMethod,

    /// The single status code that counts as "up"
    pub expected_status: u16,

    /// Check interval in minutes
    pub interval_minutes: u32,

    /// Request timeout in seconds
    pub timeout_secs: u32,

    /// Regions the monitor is probed from (e.g. `us-east-1`)
    pub regions: Vec<String>,

    pub is_paused: bool,

    pub is_deleted: bool,

    pub status: MonitorStatus,

    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Monitor {
    /// Create a monitor with the defaults the CRUD layer applies
    /// (GET, expect 200, every 5 minutes, 30s timeout, `us-east-1`).
    pub fn new(user_id: impl Into<UserId>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            url: url.into(),
            method: HttpMethod::Get,
            expected_status: 200,
            interval_minutes: 5,
            timeout_secs: 30,
            regions: vec!["us-east-1".to_string()],
            is_paused: false,
            is_deleted: false,
            status: MonitorStatus::Up,
            last_checked_at: None,
        }
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interval(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes;
        self
    }

    pub fn with_timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    /// Whether the scheduler may enqueue checks for this monitor
    pub fn is_schedulable(&self) -> bool {
        !self.is_paused && !self.is_deleted
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes.max(1)))
    }

    pub fn target(&self) -> ProbeTarget {
        ProbeTarget {
            url: self.url.clone(),
            method: self.method,
            expected_status: self.expected_status,
            timeout_secs: self.timeout_secs,
        }
    }
}

/// Everything the prober needs to perform one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub url: String,
    pub method: HttpMethod,
    pub expected_status: u16,
    pub timeout_secs: u32,
}

/// Result of one check of one monitor from one region
///
/// Persisted as-is by the result store (append-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub monitor_id: MonitorId,
    pub region: String,
    pub checked_at: DateTime<Utc>,
    pub up: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
}

impl ProbeOutcome {
    /// An outcome that was not produced by a real response
    /// (worker panic, hard deadline exceeded).
    pub fn failure(
        monitor_id: MonitorId,
        region: impl Into<String>,
        response_time_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            monitor_id,
            region: region.into(),
            checked_at: Utc::now(),
            up: false,
            status_code: None,
            response_time_ms,
            error_message: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Acknowledged => "ACKNOWLEDGED",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }

    /// Open and acknowledged incidents both still track an ongoing outage
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(IncidentStatus::Open),
            "ACKNOWLEDGED" => Ok(IncidentStatus::Acknowledged),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            _ => Err(ParseEnumError::new("incident status", s)),
        }
    }
}

/// A period during which a monitor is considered down. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub monitor_id: MonitorId,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: IncidentStatus,
    pub summary: String,
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn open(monitor_id: MonitorId, opened_at: DateTime<Utc>, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id,
            opened_at,
            resolved_at: None,
            status: IncidentStatus::Open,
            summary: summary.into(),
            last_notified_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecipient {
    pub id: Uuid,
    pub monitor_id: MonitorId,
    pub email: String,
}

impl AlertRecipient {
    pub fn new(monitor_id: MonitorId, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id,
            email: email.into(),
        }
    }
}

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Plan {
    Basic,
    Premium,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Basic => "BASIC",
            Plan::Premium => "PREMIUM",
            Plan::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BASIC" => Ok(Plan::Basic),
            "PREMIUM" => Ok(Plan::Premium),
            "ENTERPRISE" => Ok(Plan::Enterprise),
            _ => Err(ParseEnumError::new("plan", s)),
        }
    }
}

/// Limits of one plan. A limit of `-1` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConfig {
    pub monitors: i64,

    pub alert_recipients: i64,

    /// Shortest allowed check interval in minutes (may be fractional)
    pub min_check_interval: f64,

    pub data_retention_days: u32,

    pub allowed_regions: Vec<String>,
}

/// Severity of a monitor log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ParseEnumError::new("log level", s)),
        }
    }
}

/// Region used for log entries that concern the monitor as a whole
pub const ALL_REGIONS: &str = "*";

/// User-visible event history of a monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorLogEntry {
    pub monitor_id: MonitorId,
    pub region: String,
    pub level: LogLevel,
    pub message: String,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl MonitorLogEntry {
    pub fn new(
        monitor_id: MonitorId,
        region: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            monitor_id,
            region: region.into(),
            level,
            message: message.into(),
            meta: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Uptime summary computed over stored results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeStats {
    pub total_checks: u64,
    pub up_checks: u64,

    /// `up_checks / total_checks * 100`, or 100 when nothing was checked yet
    pub uptime_percent: f64,

    pub avg_response_time_ms: Option<f64>,
}

impl UptimeStats {
    pub fn from_counts(total_checks: u64, up_checks: u64, avg_response_time_ms: Option<f64>) -> Self {
        let uptime_percent = if total_checks == 0 {
            100.0
        } else {
            up_checks as f64 / total_checks as f64 * 100.0
        };

        Self {
            total_checks,
            up_checks,
            uptime_percent,
            avg_response_time_ms,
        }
    }
}
