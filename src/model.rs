use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type Tags = BTreeMap<String, String>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Way,
    Relation,
    Node,
}

impl ElementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Way => "way",
            Self::Relation => "relation",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of the Overpass `elements` array, discriminated on `type`.
///
/// Fields Overpass adds that the join does not need (`nodes`, `members`,
/// `bounds`) are ignored during deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeoElement {
    Way {
        id: i64,
        #[serde(default)]
        tags: Tags,
    },
    Relation {
        id: i64,
        #[serde(default)]
        tags: Tags,
    },
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        #[serde(default)]
        tags: Tags,
    },
}

impl GeoElement {
    pub fn id(&self) -> i64 {
        match self {
            Self::Way { id, .. } | Self::Relation { id, .. } | Self::Node { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            Self::Way { .. } => ElementKind::Way,
            Self::Relation { .. } => ElementKind::Relation,
            Self::Node { .. } => ElementKind::Node,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildingGroup {
    pub id: i64,
    pub kind: ElementKind,
    pub tags: Tags,
    pub organizations: Vec<OrganizationRecord>,
}

/// Flattened report projection of a building. The serialized field names are
/// the report column names, so the compact JSON form doubles as the corpus
/// line handed to the synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "info")]
    pub tags: Tags,
    #[serde(rename = "orgs_count")]
    pub org_count: usize,
    #[serde(rename = "orgs")]
    pub organizations: Vec<OrganizationRecord>,
}

impl ReportRow {
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(self.id, self.kind.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub id: i64,
    pub kind: String,
}

impl CompositeKey {
    pub fn new(id: i64, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.id, self.kind)
    }
}

/// A key that appeared more than once in the report. `replaced_record` is the
/// 1-based position that was shadowed by `record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCollision {
    pub key: CompositeKey,
    pub replaced_record: usize,
    pub record: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JudgmentId {
    Number(i64),
    Float(f64),
    Text(String),
}

impl JudgmentId {
    /// Integral floats such as `1.0` count as integers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Float(value) => {
                let integral = value.is_finite()
                    && value.fract() == 0.0
                    && *value >= i64::MIN as f64
                    && *value < i64::MAX as f64;
                integral.then_some(*value as i64)
            }
            Self::Text(value) => value.trim().parse::<i64>().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelJudgment {
    pub id: JudgmentId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ModelJudgment {
    /// `None` when the model emitted an identifier that is not an integer.
    pub fn key(&self) -> Option<CompositeKey> {
        self.id
            .as_i64()
            .map(|id| CompositeKey::new(id, self.kind.clone()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupingStats {
    pub elements_total: usize,
    pub structural_elements: usize,
    pub node_elements: usize,
    pub groups_emitted: usize,
    pub structures_without_organizations: usize,
    pub trailing_nodes_dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectPaths {
    pub output_dir: String,
    pub report_path: String,
    pub elements_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub city: String,
    pub source: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub fetch_duration_ms: u128,
    pub paths: CollectPaths,
    pub counts: GroupingStats,
    pub report_rows: usize,
    pub report_sha256: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowArtifact {
    pub index: usize,
    pub chars: usize,
    pub attempts: u32,
    pub duration_ms: u128,
    pub raw_path: String,
    pub raw_sha256: String,
    pub structured_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub model: String,
    pub report_path: String,
    pub judgments_dir: String,
    pub corpus_chars: usize,
    pub window_chars: usize,
    pub window_count: usize,
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub windows: Vec<WindowArtifact>,
    pub failure_reason: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedArtifact {
    pub path: String,
    pub reason: String,
    pub fragment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub index_rows: usize,
    pub key_collisions: usize,
    pub artifacts_found: usize,
    pub artifacts_parsed: usize,
    pub judgments_total: usize,
    pub judgments_matched: usize,
    pub judgments_unmatched: usize,
    pub judgments_malformed: usize,
    pub corpus_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub model: String,
    pub report_path: String,
    pub judgments_dir: String,
    pub final_path: String,
    pub final_sha256: Option<String>,
    pub counts: ReconcileCounts,
    pub collisions: Vec<KeyCollision>,
    pub skipped_artifacts: Vec<SkippedArtifact>,
    pub warnings: Vec<String>,
}
