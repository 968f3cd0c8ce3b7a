use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Family of related test outputs, e.g. one named test.
pub type Grouping = String;
/// Content hash of one concrete output artifact.
pub type Digest = String;

/// Triage classification of a (grouping, digest) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    #[default]
    Untriaged,
    Positive,
    Negative,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Untriaged => "untriaged",
            Label::Positive => "positive",
            Label::Negative => "negative",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "untriaged" => Ok(Label::Untriaged),
            "positive" => Ok(Label::Positive),
            "negative" => Ok(Label::Negative),
            other => Err(format!(
                "unknown label '{}' (expected positive, negative or untriaged)",
                other
            )),
        }
    }
}

/// Identity of a triage entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    pub grouping: Grouping,
    pub digest: Digest,
}

impl Id {
    pub fn new(grouping: impl Into<Grouping>, digest: impl Into<Digest>) -> Self {
        Self {
            grouping: grouping.into(),
            digest: digest.into(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.grouping, self.digest)
    }
}

/// One requested label change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub grouping: Grouping,
    pub digest: Digest,
    pub label: Label,
}

impl Delta {
    pub fn new(grouping: impl Into<Grouping>, digest: impl Into<Digest>, label: Label) -> Self {
        Self {
            grouping: grouping.into(),
            digest: digest.into(),
            label,
        }
    }

    pub fn id(&self) -> Id {
        Id::new(self.grouping.clone(), self.digest.clone())
    }
}

/// The read model: grouping -> digest -> label.
///
/// Pairs without an entry are [`Label::Untriaged`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    labels: HashMap<Grouping, HashMap<Digest, Label>>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, grouping: impl Into<Grouping>, digest: impl Into<Digest>, label: Label) {
        self.labels
            .entry(grouping.into())
            .or_default()
            .insert(digest.into(), label);
    }

    pub fn classification(&self, grouping: &str, digest: &str) -> Label {
        self.labels
            .get(grouping)
            .and_then(|digests| digests.get(digest))
            .copied()
            .unwrap_or_default()
    }

    /// Number of (grouping, digest) pairs with an explicit label.
    pub fn len(&self) -> usize {
        self.labels.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overlays `other` on top of `self`; labels in `other` win.
    pub fn merge(&mut self, other: &Expectations) {
        for (grouping, digests) in &other.labels {
            let target = self.labels.entry(grouping.clone()).or_default();
            for (digest, label) in digests {
                target.insert(digest.clone(), *label);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Label)> {
        self.labels.iter().flat_map(|(grouping, digests)| {
            digests
                .iter()
                .map(move |(digest, label)| (grouping.as_str(), digest.as_str(), *label))
        })
    }

    /// All labels as deltas, sorted by grouping then digest.
    pub fn as_deltas(&self) -> Vec<Delta> {
        let mut out: Vec<Delta> = self
            .iter()
            .map(|(g, d, l)| Delta::new(g, d, l))
            .collect();
        out.sort_by(|a, b| {
            a.grouping
                .cmp(&b.grouping)
                .then_with(|| a.digest.cmp(&b.digest))
        });
        out
    }
}

/// One committed (or stuck) triage action as shown in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageLogEntry {
    pub id: String,
    pub user: String,
    pub ts: DateTime<Utc>,
    pub change_count: usize,
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_of: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<TriageDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageDetail {
    pub grouping: Grouping,
    pub digest: Digest,
    pub label: Label,
}

/// Who set a label on one entry, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageHistory {
    pub user: String,
    pub ts: DateTime<Utc>,
    pub label: Label,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untriaged_is_default() {
        let e = Expectations::new();
        assert_eq!(e.classification("g", "d"), Label::Untriaged);
        assert!(e.is_empty());
    }

    #[test]
    fn merge_prefers_other() {
        let mut master = Expectations::new();
        master.set("g", "d1", Label::Positive);
        master.set("g", "d2", Label::Negative);

        let mut cl = Expectations::new();
        cl.set("g", "d2", Label::Positive);
        cl.set("h", "d3", Label::Negative);

        master.merge(&cl);
        assert_eq!(master.classification("g", "d1"), Label::Positive);
        assert_eq!(master.classification("g", "d2"), Label::Positive);
        assert_eq!(master.classification("h", "d3"), Label::Negative);
        assert_eq!(master.len(), 3);
    }

    #[test]
    fn as_deltas_is_sorted() {
        let mut e = Expectations::new();
        e.set("b", "2", Label::Positive);
        e.set("a", "9", Label::Negative);
        e.set("b", "1", Label::Negative);
        let ids: Vec<_> = e
            .as_deltas()
            .into_iter()
            .map(|d| format!("{}/{}", d.grouping, d.digest))
            .collect();
        assert_eq!(ids, vec!["a/9", "b/1", "b/2"]);
    }

    #[test]
    fn label_parse_and_serde() {
        assert_eq!("Positive".parse::<Label>().unwrap(), Label::Positive);
        assert!("maybe".parse::<Label>().is_err());
        assert_eq!(
            serde_json::to_string(&Label::Negative).unwrap(),
            "\"negative\""
        );
    }
}
