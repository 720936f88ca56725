//! CSV output formatter

use crate::PluginError;
use super::{ResultFormatter, ResultView, COLUMNS};

impl ResultFormatter for super::CsvFormatter {
    fn format(&self, view: &ResultView) -> Result<String, PluginError> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        writer.write_record(COLUMNS).map_err(csv_error)?;
        for row in &view.rows {
            // Multi-valued cells use ';' so every record stays on one line
            let cells: Vec<String> = row.cells().into_iter().map(|c| c.replace('\n', ";")).collect();
            writer.write_record(&cells).map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| PluginError::Format(format!("CSV flush error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| PluginError::Format(format!("CSV encoding error: {}", e)))
    }
}

fn csv_error(e: csv::Error) -> PluginError {
    PluginError::Format(format!("CSV write error: {}", e))
}
