//! Patch validation - the security boundary between wire JSON and the document.
//!
//! Rules run in a fixed order (operation, path, component whitelist, schema and
//! payload ceilings, set index) and the first failing rule decides the
//! rejection kind. Validation is a pure function of the current document length
//! and the raw patch.

use serde_json::Value;
use shared_types::{
    ChartComponent, Component, ComponentKind, MapComponent, Patch, PatchErrorKind, PatchOp,
    PatchRejection, TableComponent, CHILDREN_PATH,
};
use validator::Validate;

/// Longest accepted component id.
pub const MAX_COMPONENT_ID_LEN: usize = 128;

/// Size ceilings enforced before a patch may touch the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLimits {
    pub max_children: usize,
    pub max_table_rows: usize,
    pub max_table_columns: usize,
    pub max_chart_points: usize,
    pub max_chart_series: usize,
    pub max_map_features: usize,
}

impl Default for PatchLimits {
    fn default() -> Self {
        Self {
            max_children: 50,
            max_table_rows: 200,
            max_table_columns: 50,
            max_chart_points: 1_000,
            max_chart_series: 20,
            max_map_features: 500,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchValidator {
    limits: PatchLimits,
}

impl PatchValidator {
    pub fn new(limits: PatchLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PatchLimits {
        &self.limits
    }

    pub fn validate(&self, document_len: usize, raw: &Value) -> Result<Patch, PatchRejection> {
        let op = parse_op(raw)?;

        let path = raw.get("path").and_then(Value::as_str).unwrap_or_default();
        if path != CHILDREN_PATH {
            return Err(PatchRejection::new(
                PatchErrorKind::InvalidPath,
                format!("path '{path}' is not writable; only '{CHILDREN_PATH}' is"),
            ));
        }

        let value = match raw.get("value") {
            Some(value @ Value::Object(_)) => value,
            Some(_) => {
                return Err(PatchRejection::new(
                    PatchErrorKind::SchemaViolation,
                    "patch value must be an object",
                ))
            }
            None => {
                return Err(PatchRejection::new(
                    PatchErrorKind::SchemaViolation,
                    "patch value is missing",
                ))
            }
        };

        let kind = parse_kind(value)?;
        let component = self.parse_component(kind, value)?;

        let index = match op {
            PatchOp::Append => None,
            PatchOp::Set => Some(parse_index(raw, document_len)?),
        };

        Ok(Patch {
            op,
            path: CHILDREN_PATH.to_string(),
            value: component,
            index,
        })
    }

    fn parse_component(&self, kind: ComponentKind, value: &Value) -> Result<Component, PatchRejection> {
        let component = match kind {
            ComponentKind::Table => {
                let table: TableComponent = decode(kind, value)?;
                self.check_table(&table)?;
                Component::Table(table)
            }
            ComponentKind::Chart => {
                let chart: ChartComponent = decode(kind, value)?;
                self.check_chart(&chart)?;
                Component::Chart(chart)
            }
            ComponentKind::Map => {
                let map: MapComponent = decode(kind, value)?;
                self.check_map(&map)?;
                Component::Map(map)
            }
        };
        check_id(component.id())?;
        Ok(component)
    }

    fn check_table(&self, table: &TableComponent) -> Result<(), PatchRejection> {
        let columns = table.data.columns.len();
        if columns > self.limits.max_table_columns {
            return Err(too_large("Table", "columns", columns, self.limits.max_table_columns));
        }
        let rows = table.data.rows.len();
        if rows > self.limits.max_table_rows {
            return Err(too_large("Table", "rows", rows, self.limits.max_table_rows));
        }
        for column in &table.data.columns {
            column
                .validate()
                .map_err(|e| schema(format!("Table column '{}': {e}", column.key)))?;
        }
        for (row_index, row) in table.data.rows.iter().enumerate() {
            if let Some((key, _)) = row.iter().find(|(_, cell)| !is_primitive(cell)) {
                return Err(schema(format!(
                    "Table row {row_index} cell '{key}' must be a string, number, boolean or null"
                )));
            }
        }
        Ok(())
    }

    fn check_chart(&self, chart: &ChartComponent) -> Result<(), PatchRejection> {
        let series = chart.data.series.len();
        if series > self.limits.max_chart_series {
            return Err(too_large("Chart", "series", series, self.limits.max_chart_series));
        }
        let points = chart.data.point_count();
        if points > self.limits.max_chart_points {
            return Err(too_large("Chart", "points", points, self.limits.max_chart_points));
        }
        if chart
            .data
            .series
            .iter()
            .flat_map(|s| s.points.iter())
            .any(|p| !p.y.is_finite())
        {
            return Err(schema("Chart point y values must be finite numbers"));
        }
        Ok(())
    }

    fn check_map(&self, map: &MapComponent) -> Result<(), PatchRejection> {
        let features = map.data.features.len();
        if features > self.limits.max_map_features {
            return Err(too_large("Map", "features", features, self.limits.max_map_features));
        }
        for (i, feature) in map.data.features.iter().enumerate() {
            feature
                .validate()
                .map_err(|e| schema(format!("Map feature {i}: {e}")))?;
        }
        if let Some(center) = &map.config.center {
            center
                .validate()
                .map_err(|e| schema(format!("Map center: {e}")))?;
        }
        Ok(())
    }
}

fn parse_op(raw: &Value) -> Result<PatchOp, PatchRejection> {
    let op = raw.get("op").and_then(Value::as_str).unwrap_or_default();
    op.parse::<PatchOp>().map_err(|_| {
        PatchRejection::new(
            PatchErrorKind::UnknownOperation,
            format!("unknown operation '{op}'; expected 'append' or 'set'"),
        )
    })
}

fn parse_kind(value: &Value) -> Result<ComponentKind, PatchRejection> {
    let Some(tag) = value.get("type").and_then(Value::as_str) else {
        return Err(PatchRejection::new(
            PatchErrorKind::UnknownComponentType,
            "component type is missing",
        ));
    };
    tag.parse::<ComponentKind>().map_err(|_| {
        PatchRejection::new(
            PatchErrorKind::UnknownComponentType,
            format!("component type '{tag}' is not whitelisted"),
        )
    })
}

fn parse_index(raw: &Value, document_len: usize) -> Result<usize, PatchRejection> {
    let out_of_range = |detail: String| PatchRejection::new(PatchErrorKind::IndexOutOfRange, detail);
    let Some(index) = raw.get("index") else {
        return Err(out_of_range("set requires an index".to_string()));
    };
    let Some(index) = index.as_u64() else {
        return Err(out_of_range(format!("index {index} is not a non-negative integer")));
    };
    match usize::try_from(index) {
        Ok(i) if i < document_len => Ok(i),
        _ => Err(out_of_range(format!(
            "index {index} is out of range for {document_len} children"
        ))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: ComponentKind, value: &Value) -> Result<T, PatchRejection> {
    T::deserialize(value).map_err(|e| schema(format!("{kind} payload: {e}")))
}

fn check_id(id: &str) -> Result<(), PatchRejection> {
    if id.trim().is_empty() {
        return Err(schema("component id must not be empty"));
    }
    if id.chars().count() > MAX_COMPONENT_ID_LEN {
        return Err(schema(format!(
            "component id exceeds {MAX_COMPONENT_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

fn schema(message: impl Into<String>) -> PatchRejection {
    PatchRejection::new(PatchErrorKind::SchemaViolation, message)
}

fn too_large(kind: &str, what: &str, actual: usize, limit: usize) -> PatchRejection {
    PatchRejection::new(
        PatchErrorKind::PayloadTooLarge,
        format!("{kind} has {actual} {what}; the limit is {limit}"),
    )
}
