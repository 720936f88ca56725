//! JSON output formatter

use serde::Serialize;

use crate::PluginError;
use super::{ResultFormatter, ResultRow, ResultView, Summary};

/// Serializable result view for JSON output
#[derive(Serialize)]
struct ResultJson<'a> {
    /// Full search term
    search_term: &'a str,
    /// Summary block, term shortened as displayed
    summary: &'a Summary,
    /// Table rows
    rows: &'a [ResultRow],
}

impl ResultFormatter for super::JsonFormatter {
    fn format(&self, view: &ResultView) -> Result<String, PluginError> {
        let doc = ResultJson {
            search_term: view.copy_pattern(),
            summary: &view.summary,
            rows: &view.rows,
        };

        serde_json::to_string_pretty(&doc)
            .map_err(|e| PluginError::Format(format!("JSON serialization error: {}", e)))
    }
}
