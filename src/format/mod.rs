//! Result view model and output formatters

mod json;
mod csv;

pub use self::json::*;
pub use self::csv::*;

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use clap::ValueEnum;
use serde::Serialize;

use crate::classify::{ClassifiedResult, MatchClassification, Verdict, VerdictCounts};
use crate::logging::{log_warn, Logger};
use crate::search::{GoodwareMatch, MalwareMatch};
use crate::PluginError;

/// Column headers of the result table
pub const COLUMNS: [&str; 6] = [
    "Classification",
    "Malware Family",
    "Labels",
    "Threat Type",
    "SHA256",
    "Last Seen",
];

/// Index of the family column
pub const FAMILY_COLUMN: usize = 1;
/// Index of the hash column
pub const SHA256_COLUMN: usize = 4;

/// Characters of the search term shown in the summary
pub const TERM_PREVIEW_LEN: usize = 16;

/// Supported output formats for search results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Summary plus aligned table (default)
    #[default]
    Text,
    /// JSON document
    Json,
    /// CSV rows under the table header
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "table" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::Csv]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ResultFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for result views
pub trait ResultFormatter {
    /// Render a result view
    fn format(&self, view: &ResultView) -> Result<String, PluginError>;
}

/// Format results as a summary and aligned table
pub struct TextFormatter;

/// Format results as JSON
pub struct JsonFormatter;

/// Format results as CSV
pub struct CsvFormatter;

/// Header block of the result view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Search term, shortened for display
    pub search_term: String,
    pub matches: u64,
    pub first_seen: String,
    pub last_seen: String,
    pub counts: VerdictCounts,
}

/// What activating a row's hash opens.
#[derive(Debug, Clone, PartialEq)]
enum RowTarget {
    Malware { analysis_id: Option<String> },
    Goodware(Box<GoodwareMatch>),
}

/// One table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub verdict: Verdict,
    /// Display families; empty for goodware
    pub families: Vec<String>,
    pub labels: Vec<String>,
    pub threat_type: String,
    pub sha256: String,
    pub last_seen: String,
    #[serde(skip)]
    target: RowTarget,
}

impl ResultRow {
    fn malware(m: &MalwareMatch, c: &MatchClassification) -> Self {
        Self {
            verdict: c.verdict(),
            families: c.families.clone(),
            labels: c.labels.clone(),
            threat_type: c.threat_type.clone().unwrap_or_default(),
            sha256: m.sha256.clone(),
            last_seen: format_date(m.last_seen),
            target: RowTarget::Malware {
                analysis_id: m.analysis_id().map(str::to_string),
            },
        }
    }

    fn goodware(g: &GoodwareMatch) -> Self {
        Self {
            verdict: Verdict::Goodware,
            families: Vec::new(),
            labels: Vec::new(),
            threat_type: String::new(),
            sha256: g.sha256.clone(),
            last_seen: String::new(),
            target: RowTarget::Goodware(Box::new(g.clone())),
        }
    }

    /// Text of column `col`, multi-valued cells joined by newlines
    pub fn cell(&self, col: usize) -> Option<String> {
        let text = match col {
            0 => self.verdict.to_string(),
            1 => self.families.join("\n"),
            2 => self.labels.join("\n"),
            3 => self.threat_type.clone(),
            4 => self.sha256.clone(),
            5 => self.last_seen.clone(),
            _ => return None,
        };
        Some(text)
    }

    /// All six cells in column order
    pub fn cells(&self) -> Vec<String> {
        (0..COLUMNS.len()).filter_map(|c| self.cell(c)).collect()
    }
}

/// Key/value listing shown for a goodware hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoodwareDetails {
    pub fields: Vec<(String, String)>,
}

impl GoodwareDetails {
    /// Collect the fixed fields followed by version-resource strings
    pub fn from_match(g: &GoodwareMatch) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let mut fields = vec![
            ("SHA256".to_string(), g.sha256.clone()),
            ("Name".to_string(), text(&g.name)),
            ("Size".to_string(), text(&g.size)),
            ("Type".to_string(), text(&g.file_type)),
            ("Subsystem".to_string(), text(&g.subsystem)),
            ("Machine Type".to_string(), text(&g.machine_type)),
            ("Linker Version".to_string(), text(&g.linker_version)),
        ];
        fields.extend(g.string_info());
        Self { fields }
    }
}

impl fmt::Display for GoodwareDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0) + 1;
        for (key, value) in &self.fields {
            writeln!(f, "{:<width$} {}", format!("{}:", key), value, width = width)?;
        }
        Ok(())
    }
}

/// Result of activating a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drilldown {
    /// Open this URL in a browser
    OpenUrl(String),
    /// Show a local details dialog
    GoodwareDetails(GoodwareDetails),
}

/// Everything a host needs to draw the results window.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultView {
    search_term: String,
    pub summary: Summary,
    pub rows: Vec<ResultRow>,
}

impl ResultView {
    /// Build the view for `search_term`
    pub fn new(search_term: &str, classified: &ClassifiedResult) -> Self {
        let result = &classified.result;
        let mut rows: Vec<ResultRow> = result
            .results
            .iter()
            .zip(&classified.matches)
            .map(|(m, c)| ResultRow::malware(m, c))
            .collect();
        rows.extend(result.goodware_results.iter().map(ResultRow::goodware));

        let summary = Summary {
            search_term: shorten_term(search_term),
            matches: result.result_count,
            first_seen: format_date(result.first_seen),
            last_seen: format_date(result.last_seen),
            counts: classified.counts,
        };

        Self {
            search_term: search_term.to_string(),
            summary,
            rows,
        }
    }

    /// Full, untruncated search term for "copy pattern"
    pub fn copy_pattern(&self) -> &str {
        &self.search_term
    }

    /// What double-clicking cell (`row`, `col`) should do.
    ///
    /// Only the family and hash columns react. A family cell without a
    /// usable family logs a warning and yields nothing.
    pub fn activate(&self, row: usize, col: usize, log: &Logger) -> Option<Drilldown> {
        let r = self.rows.get(row)?;
        match col {
            SHA256_COLUMN => match &r.target {
                RowTarget::Malware {
                    analysis_id: Some(id),
                } => Some(Drilldown::OpenUrl(results_url(id, &r.sha256))),
                RowTarget::Malware { analysis_id: None } => {
                    log_warn!(log, "No analysis for {}", r.sha256);
                    None
                }
                RowTarget::Goodware(g) => Some(Drilldown::GoodwareDetails(GoodwareDetails::from_match(g))),
            },
            FAMILY_COLUMN => match r.families.first() {
                Some(family) if !family.eq_ignore_ascii_case("unknown") => {
                    Some(Drilldown::OpenUrl(family_search_url(family)))
                }
                _ => {
                    log_warn!(log, "No family");
                    None
                }
            },
            _ => None,
        }
    }
}

/// Web view of one analysis
pub fn results_url(analysis_id: &str, sha256: &str) -> String {
    format!("https://www.unpac.me/results/{}?hash={}", analysis_id, sha256)
}

/// UnpacMe search for every sample of a family
pub fn family_search_url(family: &str) -> String {
    let term = format!("malware:\"{}\"", family);
    format!(
        "https://www.unpac.me/search?terms={}",
        base64::engine::general_purpose::STANDARD.encode(term.as_bytes())
    )
}

/// `%Y-%m-%d` in UTC; empty when the timestamp is missing or out of range
pub fn format_date(timestamp: Option<i64>) -> String {
    timestamp
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn shorten_term(term: &str) -> String {
    if term.chars().count() > TERM_PREVIEW_LEN {
        let head: String = term.chars().take(TERM_PREVIEW_LEN).collect();
        format!("{}...", head)
    } else {
        term.to_string()
    }
}

impl ResultFormatter for TextFormatter {
    fn format(&self, view: &ResultView) -> Result<String, PluginError> {
        let s = &view.summary;
        let mut output = String::new();

        output.push_str(&format!("Search Term: {}\n", s.search_term));
        output.push_str(&format!("Matches:     {}\n", s.matches));
        output.push_str(&format!("First Seen:  {}\n", s.first_seen));
        output.push_str(&format!("Last Seen:   {}\n", s.last_seen));
        output.push_str(&format!(
            "Goodware: {}  Unknown: {}  Malicious: {}\n\n",
            s.counts.goodware, s.counts.unknown, s.counts.malicious
        ));

        let rows: Vec<Vec<String>> = view
            .rows
            .iter()
            .map(|r| r.cells().into_iter().map(|c| c.replace('\n', ", ")).collect())
            .collect();

        let mut widths: Vec<usize> = COLUMNS.iter().map(|c| c.len()).collect();
        for row in &rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.chars().count());
            }
        }

        let header: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();
        for row in std::iter::once(&header).chain(rows.iter()) {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, w)| format!("{:<w$}", cell, w = *w))
                .collect::<Vec<_>>()
                .join("  ");
            output.push_str(line.trim_end());
            output.push('\n');
        }

        Ok(output)
    }
}
