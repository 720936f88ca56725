//! Reduce raw search matches to verdicts and per-family counts.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::search::{MalwareMatch, SearchResult};

/// Classification used when no classifier fired
pub const UNKNOWN: &str = "UNKNOWN";
/// Classification for known-bad samples
pub const MALICIOUS: &str = "MALICIOUS";
/// Synthetic classification key holding the goodware file count
pub const GOODWARE: &str = "GOODWARE";

/// Table-level verdict of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Malicious,
    Unknown,
    Goodware,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Malicious => write!(f, "{}", MALICIOUS),
            Verdict::Unknown => write!(f, "{}", UNKNOWN),
            Verdict::Goodware => write!(f, "{}", GOODWARE),
        }
    }
}

/// What the classifier entries of one malware match add up to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchClassification {
    /// First non-empty malware family
    pub family: Option<String>,
    /// Every family, de-duplicated case-insensitively and capitalized
    pub families: Vec<String>,
    /// Primary classifier's verdict, `MALICIOUS` if only a family is known,
    /// else `UNKNOWN`
    pub classification_type: String,
    /// Primary classifier's threat type
    pub threat_type: Option<String>,
    /// Distinct entry names in first-seen order
    pub labels: Vec<String>,
}

impl MatchClassification {
    /// Row verdict
    pub fn verdict(&self) -> Verdict {
        if self.classification_type == MALICIOUS {
            Verdict::Malicious
        } else {
            Verdict::Unknown
        }
    }
}

/// Classify one malware match.
pub fn classify_match(m: &MalwareMatch) -> MatchClassification {
    let mut family = None;
    let mut families = Vec::new();
    let mut seen_lower: Vec<String> = Vec::new();
    let mut classification = None;
    let mut threat_type = None;
    let mut labels: Vec<String> = Vec::new();

    for entry in &m.malwareid {
        if let Some(name) = non_empty(&entry.malware_family) {
            if family.is_none() {
                family = Some(name.to_string());
            }
            let lower = name.to_lowercase();
            if !seen_lower.contains(&lower) {
                seen_lower.push(lower);
                families.push(capitalize(name));
            }
        }

        if entry.is_primary() {
            if classification.is_none() {
                classification = non_empty(&entry.classification_type).map(str::to_string);
            }
            if threat_type.is_none() {
                threat_type = non_empty(&entry.threat_type).map(str::to_string);
            }
        }

        if let Some(label) = non_empty(&entry.name) {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
    }

    let classification_type = match classification {
        Some(c) => c,
        None if family.is_some() => MALICIOUS.to_string(),
        None => UNKNOWN.to_string(),
    };

    MatchClassification {
        family,
        families,
        classification_type,
        threat_type,
        labels,
    }
}

/// Number of rows per verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub malicious: usize,
    pub unknown: usize,
    pub goodware: usize,
}

/// A search result together with everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedResult {
    /// The result as returned by the service
    pub result: SearchResult,
    /// One entry per malware match, same order
    pub matches: Vec<MatchClassification>,
    /// Matches per first family; matches without one count under `""`
    pub label_map: BTreeMap<String, u64>,
    /// Matches per classification, plus [`GOODWARE`]
    pub classification_map: BTreeMap<String, u64>,
    pub counts: VerdictCounts,
}

/// Classify every match and aggregate the counts.
pub fn classify(result: SearchResult) -> ClassifiedResult {
    let matches: Vec<MatchClassification> = result.results.iter().map(classify_match).collect();

    let mut label_map = BTreeMap::new();
    let mut classification_map = BTreeMap::new();
    let mut counts = VerdictCounts::default();

    for m in &matches {
        *label_map.entry(m.family.clone().unwrap_or_default()).or_insert(0) += 1;
        *classification_map.entry(m.classification_type.clone()).or_insert(0) += 1;
        match m.verdict() {
            Verdict::Malicious => counts.malicious += 1,
            _ => counts.unknown += 1,
        }
    }
    classification_map.insert(GOODWARE.to_string(), result.goodware_count());
    counts.goodware = result.goodware_results.len();

    ClassifiedResult {
        result,
        matches,
        label_map,
        classification_map,
        counts,
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Upper-case the first character and lower-case the rest
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ClassificationEntry, GoodwareMatch};

    fn entry(kind: &str, name: &str, family: Option<&str>, class: Option<&str>, threat: Option<&str>) -> ClassificationEntry {
        ClassificationEntry {
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            malware_family: family.map(str::to_string),
            classification_type: class.map(str::to_string),
            threat_type: threat.map(str::to_string),
        }
    }

    fn sample(entries: Vec<ClassificationEntry>) -> MalwareMatch {
        MalwareMatch {
            sha256: "aa".into(),
            malwareid: entries,
            ..Default::default()
        }
    }

    #[test]
    fn test_family_only_is_promoted() {
        let m = sample(vec![
            entry("", "", Some(""), None, None),
            entry("", "", Some("Emotet"), Some(""), None),
        ]);
        let c = classify_match(&m);

        assert_eq!(c.family.as_deref(), Some("Emotet"));
        assert_eq!(c.classification_type, MALICIOUS);
        assert_eq!(c.verdict(), Verdict::Malicious);
    }

    #[test]
    fn test_no_entries_is_unknown() {
        let c = classify_match(&sample(vec![]));
        assert_eq!(c.family, None);
        assert_eq!(c.classification_type, UNKNOWN);
        assert_eq!(c.verdict(), Verdict::Unknown);
        assert!(c.labels.is_empty());
    }

    #[test]
    fn test_primary_classifier_wins() {
        let m = sample(vec![
            entry("malpedia", "win.qakbot", Some("qakbot"), Some("MALICIOUS"), Some("Banker")),
            entry("unpacme", "Qakbot", Some("QAKBOT"), Some("SUSPICIOUS"), Some("Trojan")),
            entry("unpacme", "Qakbot", None, Some("MALICIOUS"), Some("Loader")),
        ]);
        let c = classify_match(&m);

        assert_eq!(c.classification_type, "SUSPICIOUS");
        assert_eq!(c.threat_type.as_deref(), Some("Trojan"));
        assert_eq!(c.verdict(), Verdict::Unknown);
        assert_eq!(c.families, vec!["Qakbot"]);
        assert_eq!(c.labels, vec!["win.qakbot", "Qakbot"]);
    }

    #[test]
    fn test_empty_primary_classification_is_skipped() {
        let m = sample(vec![
            entry("unpacme", "a", None, Some(""), None),
            entry("unpacme", "b", None, Some("MALICIOUS"), Some("Stealer")),
        ]);
        let c = classify_match(&m);
        assert_eq!(c.classification_type, MALICIOUS);
        assert_eq!(c.threat_type.as_deref(), Some("Stealer"));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("emotet"), "Emotet");
        assert_eq!(capitalize("AGENT TESLA"), "Agent tesla");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_aggregate_without_goodware_count() {
        let result = SearchResult {
            result_count: 3,
            results: vec![
                sample(vec![entry("", "", Some("Emotet"), None, None)]),
                sample(vec![entry("unpacme", "", Some("Emotet"), Some("MALICIOUS"), None)]),
                sample(vec![]),
            ],
            ..Default::default()
        };
        let classified = classify(result);

        assert_eq!(classified.classification_map.get(GOODWARE), Some(&0));
        assert_eq!(classified.classification_map.get(MALICIOUS), Some(&2));
        assert_eq!(classified.classification_map.get(UNKNOWN), Some(&1));
        assert_eq!(classified.label_map.get("Emotet"), Some(&2));
        assert_eq!(classified.label_map.get(""), Some(&1));
        assert_eq!(
            classified.counts,
            VerdictCounts {
                malicious: 2,
                unknown: 1,
                goodware: 0
            }
        );
    }

    #[test]
    fn test_aggregate_goodware() {
        let result = SearchResult {
            goodware_results: vec![GoodwareMatch::default(), GoodwareMatch::default()],
            matched_goodware_files: Some(7),
            ..Default::default()
        };
        let classified = classify(result);
        assert_eq!(classified.classification_map.get(GOODWARE), Some(&7));
        assert_eq!(classified.counts.goodware, 2);
    }
}
