//! Wire models for the UnpacMe term-search API.
//!
//! The service is loose about types: nulls show up where strings are
//! expected and some numeric fields arrive as strings. Every field that is
//! not needed for control flow is optional or defaulted.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Classifier tag of UnpacMe's own verdicts
pub const PRIMARY_CLASSIFIER: &str = "unpacme";

/// Body of a successful search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Number of malware-corpus matches
    #[serde(default)]
    pub result_count: u64,
    /// Unix seconds of the oldest match
    #[serde(default)]
    pub first_seen: Option<i64>,
    /// Unix seconds of the newest match
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<MalwareMatch>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub goodware_results: Vec<GoodwareMatch>,
    /// Absent unless the goodware repository was searched
    #[serde(default)]
    pub matched_goodware_files: Option<u64>,
    /// Advisory text to show after the results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl SearchResult {
    /// Drop goodware data, recording zero matched files
    pub fn clear_goodware(&mut self) {
        self.goodware_results.clear();
        self.matched_goodware_files = Some(0);
    }

    /// `matched_goodware_files`, 0 if absent
    pub fn goodware_count(&self) -> u64 {
        self.matched_goodware_files.unwrap_or(0)
    }
}

/// One malware-corpus sample matching the pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MalwareMatch {
    pub sha256: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub malwareid: Vec<ClassificationEntry>,
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub analysis: Vec<AnalysisRef>,
}

impl MalwareMatch {
    /// Id of the first analysis, used for the web link
    pub fn analysis_id(&self) -> Option<&str> {
        self.analysis.first().map(|a| a.id.as_str())
    }
}

/// Reference to an UnpacMe analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRef {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

/// One classifier's opinion about a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEntry {
    /// Which classifier produced the entry
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    /// Label, e.g. a rule name
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub malware_family: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub classification_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub threat_type: Option<String>,
}

impl ClassificationEntry {
    /// Returns true if UnpacMe itself produced the entry
    pub fn is_primary(&self) -> bool {
        self.kind.as_deref() == Some(PRIMARY_CLASSIFIER)
    }
}

/// A known-good file matching the pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoodwareMatch {
    pub sha256: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub size: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub file_type: Option<String>,
    // Server spelling
    #[serde(rename = "subsytem", default, deserialize_with = "lenient_string")]
    pub subsystem: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub machine_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub linker_version: Option<String>,
    #[serde(default)]
    pub metadata: Option<GoodwareMetadata>,
}

impl GoodwareMatch {
    /// Version-resource properties, empty if the server sent none
    pub fn string_info(&self) -> Vec<(String, String)> {
        self.metadata
            .as_ref()
            .map(|m| {
                m.string_info
                    .iter()
                    .map(|(k, v)| (k.clone(), value_text(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Extra goodware metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoodwareMetadata {
    #[serde(rename = "StringInfo", default, deserialize_with = "null_as_default")]
    pub string_info: BTreeMap<String, serde_json::Value>,
}

/// Body of the goodware-repository search
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GoodwareResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub goodware_results: Vec<GoodwareMatch>,
    #[serde(default)]
    pub matched_goodware_files: Option<u64>,
}

/// The only field of a 404 body worth reading
#[derive(Debug, Default, Deserialize)]
pub(crate) struct NotFoundBody {
    #[serde(default)]
    pub warning: Option<String>,
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => None,
        other => Some(value_text(&other)),
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
