use serde::{Deserialize, Serialize};

/// What a checksum unit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitKind {
    Table,
    EntityType,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Table => "table",
            UnitKind::EntityType => "entityType",
        }
    }
}

/// Verdict for one comparable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Ok,
    Warning,
    Drift,
    Unknown,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Ok => "ok",
            UnitStatus::Warning => "warning",
            UnitStatus::Drift => "drift",
            UnitStatus::Unknown => "unknown",
        }
    }
}

/// One checksum unit (a table, or one entity type's slice of `entities`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumUnit {
    pub kind: UnitKind,
    pub name: String,
    pub checksum: String,
    pub row_count: u64,
}

/// Snapshot of per-unit checksums a client uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub client_id: String,
    pub snapshot_at: i64,
    pub units: Vec<ChecksumUnit>,
}

/// Comparison verdict for one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub kind: UnitKind,
    pub name: String,
    pub status: UnitStatus,
}

/// Aggregate verdict for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Ok,
    Warning,
    Drift,
}

/// Consistency report entry for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientReport {
    pub client_id: String,
    pub status: ClientStatus,
    pub snapshot_at: Option<i64>,
    pub last_pulled_server_seq: i64,
    pub diffs: Vec<DiffEntry>,
}

/// Server-side header of the consistency report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerReport {
    pub source: String,
    pub server_seq: i64,
}

/// Full consistency report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub server: ServerReport,
    pub clients: Vec<ClientReport>,
}

/// Aggregated signal level derived from a client's diffs and lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalLevel {
    Normal,
    Observe,
    Degraded,
    Critical,
}

impl SignalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalLevel::Normal => "normal",
            SignalLevel::Observe => "observe",
            SignalLevel::Degraded => "degraded",
            SignalLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(SignalLevel::Normal),
            "observe" => Some(SignalLevel::Observe),
            "degraded" => Some(SignalLevel::Degraded),
            "critical" => Some(SignalLevel::Critical),
            _ => None,
        }
    }
}

/// One computed autoheal signal for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutohealSignal {
    pub level: SignalLevel,
    pub drift_count: u32,
    pub warning_count: u32,
    pub unknown_count: u32,
    pub comparable_count: u32,
    pub lag: i64,
    pub lag_ratio: f64,
    pub fingerprint: String,
    pub computed_at: i64,
}

/// Outcome of one autoheal evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutohealOutcome {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
}

impl AutohealOutcome {
    pub fn skipped(reason: &str) -> Self {
        Self {
            queued: false,
            reason: Some(reason.to_string()),
            request_id: None,
            request_type: None,
        }
    }
}
