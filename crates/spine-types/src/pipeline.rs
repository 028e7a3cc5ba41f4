use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable registration record for a work unit the Dispatcher can run
/// (§3 `PipelineSpec`). Registered once at process startup and stable for
/// the lifetime of the process — the Registry never mutates a spec after
/// `register()` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Dotted, globally unique name, e.g. `finra.otc.ingest_week`.
    pub name: String,
    pub description: String,
    pub version: String,
    pub required_params: Vec<ParamDef>,
    pub optional_params: Vec<ParamDef>,
    /// Ingest pipelines support `file_path` derivation from `(tier,
    /// week_ending)` per §4.2 step 6.
    pub is_ingest: bool,
    /// Present only when `is_ingest`; names the two param fields substituted
    /// into `file_path_template` to derive an explicit path.
    pub ingest_derivation: Option<IngestDerivation>,
    /// Concurrency key template, e.g.
    /// `domain=finra.otc_transparency; tier={tier}; week_ending={week_ending}`
    /// (§4.4). `None` means the pipeline allows unlimited concurrent runs.
    pub concurrency_key_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestDerivation {
    pub tier_field: String,
    pub week_ending_field: String,
    pub file_path_template: String,
}

/// One parameter declaration. Validation is pure: `(spec, raw) -> Result`,
/// no reflection (§9 design notes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Option<ParamValue>,
    /// Alias map applied before type coercion, e.g. `t1` / `tier1` -> `T1`
    /// for enum-typed tier parameters (§4.2 step 2).
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    Date,
    Path,
    Enum { values: Vec<String> },
}

/// A coerced parameter value, tagged so canonical JSON (§4.2 step 7) sorts
/// and compares deterministically regardless of source representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Date(chrono::NaiveDate),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}
