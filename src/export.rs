//! Query result rendering
//!
//! Turns a [`QueryResponse`] into one of the supported wire formats:
//! pretty-printed JSON, CSV, or line protocol.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::query::QueryResponse;
use crate::types::labels_json;

/// Supported export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON object `{metric, data, aggregation, interval, totalPoints}`
    Json,
    /// `timestamp,metric,value,labels` rows with a header line
    Csv,
    /// `<metric>{k="v",...} <value> <epochMillis>`, one line per point
    LineProtocol,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "line" | "line-protocol" => Ok(ExportFormat::LineProtocol),
            other => Err(Error::bad_input(
                "format",
                format!("'{}' is not one of json, csv, line", other),
            )),
        }
    }
}

/// Render a query response in the requested format
pub fn render(response: &QueryResponse, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => render_json(response),
        ExportFormat::Csv => Ok(render_csv(response)),
        ExportFormat::LineProtocol => Ok(render_line_protocol(response)),
    }
}

fn render_json(response: &QueryResponse) -> Result<String> {
    serde_json::to_string_pretty(response).map_err(Into::into)
}

fn render_csv(response: &QueryResponse) -> String {
    let mut out = String::from("timestamp,metric,value,labels\n");
    for point in &response.data {
        out.push_str(&format!(
            "{},{},{},\"{}\"\n",
            point.timestamp,
            response.metric,
            point.value,
            // CSV quoting: double any embedded quotes
            labels_json(&point.labels).replace('"', "\"\"")
        ));
    }
    out
}

fn render_line_protocol(response: &QueryResponse) -> String {
    let mut out = String::new();
    for point in &response.data {
        if point.labels.is_empty() {
            out.push_str(&format!(
                "{} {} {}\n",
                response.metric, point.value, point.timestamp
            ));
        } else {
            let labels = point
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!(
                "{}{{{}}} {} {}\n",
                response.metric, labels, point.value, point.timestamp
            ));
        }
    }
    out
}
