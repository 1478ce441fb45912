//! Shared types between the patch client, agent backends and presentation layers
//!
//! These types are used by:
//! - the `agent-stream` client core (native Rust)
//! - any backend that emits patch frames
//! - web presentation layers (TypeScript bindings exported with ts-rs)
//!
//! Serializable with serde for JSON over SSE/HTTP and the background bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use ts_rs::TS;
use validator::Validate;

// ============================================================================
// Components
// ============================================================================

/// Closed whitelist of renderable component kinds.
///
/// Anything that does not parse into one of these is rejected before it can
/// reach a renderer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, TS,
)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum ComponentKind {
    Table,
    Chart,
    Map,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 3] = [ComponentKind::Table, ComponentKind::Chart, ComponentKind::Map];
}

/// A renderable UI component, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "type")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum Component {
    Table(TableComponent),
    Chart(ChartComponent),
    Map(MapComponent),
}

impl Component {
    pub fn id(&self) -> &str {
        match self {
            Component::Table(c) => &c.id,
            Component::Chart(c) => &c.id,
            Component::Map(c) => &c.id,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Table(_) => ComponentKind::Table,
            Component::Chart(_) => ComponentKind::Chart,
            Component::Map(_) => ComponentKind::Map,
        }
    }
}

// ---- Table -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct TableComponent {
    pub id: String,
    pub data: TableData,
    #[serde(default)]
    pub config: TableConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct TableData {
    pub columns: Vec<TableColumn>,
    #[ts(type = "Array<Record<string, string | number | boolean | null>>")]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct TableColumn {
    #[validate(length(min = 1, max = 128))]
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub data_type: ColumnDataType,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum ColumnDataType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[serde(default)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct TableConfig {
    pub title: Option<String>,
    pub sortable: bool,
    pub filterable: bool,
    pub pagination: bool,
}

// ---- Chart -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ChartComponent {
    pub id: String,
    pub data: ChartData,
    #[serde(default)]
    pub config: ChartConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ChartData {
    pub series: Vec<ChartSeries>,
}

impl ChartData {
    /// Points summed across every series.
    pub fn point_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ChartSeries {
    pub name: String,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ChartPoint {
    pub x: ChartX,
    pub y: f64,
}

/// Chart x-axis value: numeric or a category label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(untagged)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum ChartX {
    Number(f64),
    Label(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum ChartType {
    #[default]
    Line,
    Bar,
    Area,
    Pie,
    Scatter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ChartConfig {
    pub title: Option<String>,
    pub chart_type: ChartType,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
}

// ---- Map -------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct MapComponent {
    pub id: String,
    pub data: MapData,
    #[serde(default)]
    pub config: MapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct MapData {
    pub features: Vec<MapFeature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct MapFeature {
    #[serde(default)]
    pub id: Option<String>,
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lng: f64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    #[ts(type = "Record<string, unknown> | null")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Validate, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct MapCenter {
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lng: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[serde(default)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct MapConfig {
    pub title: Option<String>,
    pub zoom: Option<f64>,
    pub center: Option<MapCenter>,
}

// ============================================================================
// Patch Protocol
// ============================================================================

/// The only mutation path a patch may target.
pub const CHILDREN_PATH: &str = "/children";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr, TS,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum PatchOp {
    Append,
    Set,
}

/// A patch that has passed validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    pub value: Component,
    pub index: Option<usize>,
}

/// One stream frame worth of patches.
///
/// Patches stay raw JSON until the engine validates them one by one, so a
/// single malformed entry never poisons the rest of the batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct PatchBatch {
    #[ts(type = "Array<unknown>")]
    pub patches: Vec<serde_json::Value>,
    pub request_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum PatchErrorKind {
    UnknownOperation,
    InvalidPath,
    UnknownComponentType,
    SchemaViolation,
    PayloadTooLarge,
    IndexOutOfRange,
    DocumentFull,
    DuplicateId,
}

/// Why a single patch was dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct PatchRejection {
    pub message: String,
    pub kind: PatchErrorKind,
}

impl PatchRejection {
    pub fn new(kind: PatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl std::fmt::Display for PatchRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct PatchError {
    pub patch_index: usize,
    pub error: PatchRejection,
}

// ============================================================================
// UI Document
// ============================================================================

/// Immutable snapshot of the UI tree. Replaced, never mutated, per batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct UiDocument {
    pub children: Vec<Component>,
    pub request_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Bumped once per applied batch, empty batches included.
    #[ts(type = "number")]
    pub version: u64,
}

impl UiDocument {
    pub fn empty() -> Self {
        Self {
            children: Vec::new(),
            request_id: None,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Component> {
        self.children.iter().find(|c| c.id() == id)
    }

    /// Next document in the lineage, carrying `children` and `request_id`.
    pub fn successor(&self, children: Vec<Component>, request_id: Option<String>) -> Self {
        Self {
            children,
            request_id,
            updated_at: Utc::now(),
            version: self.version + 1,
        }
    }
}

impl Default for UiDocument {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Connection State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, TS)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Open,
    Degraded,
    Reconnecting,
    Failed,
}

/// Snapshot emitted on every connection state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub is_loading: bool,
    pub connection_attempts: u32,
    pub error: Option<String>,
    #[serde(default)]
    pub phase: ConnectionPhase,
}

/// Connection tuning carried by `CONNECT`. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct ConnectionConfig {
    #[ts(type = "number")]
    pub reconnect_interval: u64,
    pub max_reconnect_attempts: u32,
    #[ts(type = "number")]
    pub heartbeat_interval: u64,
    #[ts(type = "number")]
    pub timeout: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: 3_000,
            max_reconnect_attempts: 5,
            heartbeat_interval: 30_000,
            timeout: 60_000,
        }
    }
}

// ============================================================================
// Background Bridge Protocol
// ============================================================================

/// Foreground → background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum ForegroundMsg {
    Connect {
        endpoint: String,
        config: ConnectionConfig,
    },
    Disconnect,
    SendQuery {
        message: String,
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Background → foreground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum BackgroundMsg {
    ConnectionStatus(ConnectionStatus),
    AgentResponse(AgentResponse),
    Error { message: String },
    Log { message: String, level: LogLevel },
}

/// Either a patch batch or a plain status message, plus the frame it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct AgentResponse {
    #[ts(type = "Array<unknown> | null")]
    pub patches: Option<Vec<serde_json::Value>>,
    pub message: Option<String>,
    pub request_id: Option<String>,
    pub raw_message: String,
}

impl AgentResponse {
    /// The patch batch carried by this response, if any.
    pub fn batch(&self) -> Option<PatchBatch> {
        let patches = self.patches.clone()?;
        Some(PatchBatch {
            patches,
            request_id: self.request_id.clone().unwrap_or_default(),
            message: self.message.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TS)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

// ============================================================================
// HTTP API Types
// ============================================================================

/// Body of `POST /api/agent/query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct QueryRequest {
    pub message: String,
    pub request_id: String,
    pub session_id: String,
}

/// Success body of the query endpoint. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct QueryAck {
    pub status: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub message: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(default)]
#[ts(export, export_to = "../../bindings/agent-stream.ts")]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: Option<String>,
    pub agent_ready: bool,
    pub connected_clients: u32,
}

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_STREAM_PATH: &str = "/api/agent/stream";
pub const DEFAULT_QUERY_PATH: &str = "/api/agent/query";
pub const DEFAULT_HEALTH_PATH: &str = "/health";

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ts_rs::Config;

    #[test]
    fn test_component_kind_whitelist_parsing() {
        assert_eq!("Table".parse::<ComponentKind>().unwrap(), ComponentKind::Table);
        assert_eq!("Map".parse::<ComponentKind>().unwrap(), ComponentKind::Map);
        assert!("Script".parse::<ComponentKind>().is_err());
        assert!("table".parse::<ComponentKind>().is_err());
    }

    #[test]
    fn test_table_component_from_backend_payload() {
        let value = json!({
            "id": "table-req-1",
            "type": "Table",
            "data": {
                "columns": [{"key": "response", "title": "Query Result", "dataType": "string"}],
                "rows": [{"response": "42 trips"}]
            },
            "config": {"title": "SQL Query Result", "sortable": false, "filterable": false, "pagination": false}
        });

        let component: Component = serde_json::from_value(value).unwrap();
        assert_eq!(component.id(), "table-req-1");
        assert_eq!(component.kind(), ComponentKind::Table);
        let Component::Table(table) = component else {
            panic!("expected table");
        };
        assert_eq!(table.data.columns[0].data_type, ColumnDataType::String);
        assert_eq!(table.config.title.as_deref(), Some("SQL Query Result"));
    }

    #[test]
    fn test_component_config_is_optional() {
        let value = json!({
            "id": "c1",
            "type": "Chart",
            "data": {"series": [{"name": "trips", "points": [{"x": "Mon", "y": 3.0}, {"x": 2, "y": 4}]}]}
        });
        let component: Component = serde_json::from_value(value).unwrap();
        let Component::Chart(chart) = component else {
            panic!("expected chart");
        };
        assert_eq!(chart.config.chart_type, ChartType::Line);
        assert_eq!(chart.data.point_count(), 2);
        assert_eq!(chart.data.series[0].points[0].x, ChartX::Label("Mon".to_string()));
        assert_eq!(chart.data.series[0].points[1].x, ChartX::Number(2.0));
    }

    #[test]
    fn test_map_feature_range_validation() {
        let ok = MapFeature {
            id: None,
            lat: 40.7,
            lng: -74.0,
            label: Some("NYC".to_string()),
            properties: None,
        };
        assert!(ok.validate().is_ok());

        let bad = MapFeature { lat: 91.0, ..ok };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_document_successor_bumps_version() {
        let doc = UiDocument::empty();
        let next = doc.successor(Vec::new(), Some("req-1".to_string()));
        assert_eq!(next.version, 1);
        assert_eq!(next.request_id.as_deref(), Some("req-1"));
        assert!(next.updated_at >= doc.updated_at);
    }

    #[test]
    fn test_foreground_msg_wire_shape() {
        let msg = ForegroundMsg::SendQuery {
            message: "how many trips?".to_string(),
            request_id: "r1".to_string(),
            session_id: "s1".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"type": "SEND_QUERY", "message": "how many trips?", "requestId": "r1", "sessionId": "s1"})
        );

        let disconnect = serde_json::to_value(ForegroundMsg::Disconnect).unwrap();
        assert_eq!(disconnect, json!({"type": "DISCONNECT"}));

        let connect: ForegroundMsg = serde_json::from_value(json!({
            "type": "CONNECT",
            "endpoint": "http://localhost:8000/api/agent/stream",
            "config": {"maxReconnectAttempts": 2}
        }))
        .unwrap();
        let ForegroundMsg::Connect { config, .. } = connect else {
            panic!("expected connect");
        };
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.reconnect_interval, 3_000);
        assert_eq!(config.heartbeat_interval, 30_000);
        assert_eq!(config.timeout, 60_000);
    }

    #[test]
    fn test_background_msg_wire_shape() {
        let status = BackgroundMsg::ConnectionStatus(ConnectionStatus {
            is_connected: true,
            is_loading: false,
            connection_attempts: 0,
            error: None,
            phase: ConnectionPhase::Open,
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "CONNECTION_STATUS");
        assert_eq!(json["isConnected"], true);
        assert_eq!(json["connectionAttempts"], 0);

        let log = BackgroundMsg::Log {
            message: "dropped frame".to_string(),
            level: LogLevel::Warn,
        };
        assert_eq!(
            serde_json::to_value(&log).unwrap(),
            json!({"type": "LOG", "message": "dropped frame", "level": "warn"})
        );
    }

    #[test]
    fn test_agent_response_batch() {
        let response = AgentResponse {
            patches: Some(vec![json!({"op": "append"})]),
            message: Some("Response from SQL agent".to_string()),
            request_id: Some("r9".to_string()),
            raw_message: "{}".to_string(),
        };
        let batch = response.batch().unwrap();
        assert_eq!(batch.request_id, "r9");
        assert_eq!(batch.patches.len(), 1);

        let message_only = AgentResponse {
            patches: None,
            ..response
        };
        assert!(message_only.batch().is_none());
    }

    #[test]
    fn export_types() {
        let config = Config::default();
        ComponentKind::export(&config).unwrap();
        Component::export(&config).unwrap();
        PatchBatch::export(&config).unwrap();
        PatchError::export(&config).unwrap();
        UiDocument::export(&config).unwrap();
        ConnectionStatus::export(&config).unwrap();
        ConnectionConfig::export(&config).unwrap();
        ForegroundMsg::export(&config).unwrap();
        BackgroundMsg::export(&config).unwrap();
        QueryRequest::export(&config).unwrap();
    }
}
