//! Pipeline registration and the parameter validation pipeline (§4.2).
//!
//! Registration is process-wide and stable for the lifetime of a process: a
//! [`PipelineSpec`] is either registered at startup or not known, and the
//! registry never mutates or removes one afterward. [`validate`] runs the
//! seven-step pipeline a caller's raw parameters go through before an
//! execution can be submitted — alias resolution, type coercion, required
//! enforcement, defaults, ingest `file_path` derivation, and canonical-JSON
//! idempotency-key production.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use serde_json::json;
//! use spine_registry::{validate, PipelineRegistry};
//! use spine_types::{ParamDef, ParamKind, PipelineSpec};
//!
//! let mut registry = PipelineRegistry::new();
//! registry
//!     .register(PipelineSpec {
//!         name: "finra.otc.ingest_week".to_string(),
//!         description: "weekly OTC ingest".to_string(),
//!         version: "1".to_string(),
//!         required_params: vec![ParamDef {
//!             name: "tier".to_string(),
//!             kind: ParamKind::Enum { values: vec!["T1".to_string(), "T2".to_string()] },
//!             default: None,
//!             aliases: BTreeMap::from([("t1".to_string(), "T1".to_string())]),
//!         }],
//!         optional_params: vec![],
//!         is_ingest: false,
//!         ingest_derivation: None,
//!         concurrency_key_template: None,
//!     })
//!     .unwrap();
//!
//! let raw = serde_json::from_value(json!({ "tier": "t1" })).unwrap();
//! let call = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
//! assert_eq!(call.params.get("tier").unwrap().as_str(), Some("T1"));
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use spine_types::{ErrorCategory, ParamDef, ParamKind, ParamValue, PipelineSpec, SpineError};

/// Errors raised while registering pipelines or validating a call, before
/// conversion into the shared [`SpineError`] shape at the crate boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("pipeline already registered: {0}")]
    AlreadyRegistered(String),
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),
    #[error("invalid parameter {field}: {reason}")]
    ParamInvalid { field: String, reason: String },
    #[error("missing required parameter {field}")]
    ParamMissing { field: String },
    #[error("ingest source could not be resolved for pipeline {pipeline}")]
    IngestSourceUnresolved { pipeline: String },
}

impl From<RegistryError> for SpineError {
    fn from(err: RegistryError) -> Self {
        let category = match &err {
            RegistryError::AlreadyRegistered(_) => ErrorCategory::Conflict,
            RegistryError::PipelineNotFound(_) => ErrorCategory::NotFound,
            RegistryError::ParamInvalid { .. }
            | RegistryError::ParamMissing { .. }
            | RegistryError::IngestSourceUnresolved { .. } => ErrorCategory::Validation,
        };
        SpineError::new(category, err.to_string())
    }
}

/// Process-wide table of registered pipelines, keyed by exact name.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, PipelineSpec>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec. Fails if a pipeline with this name is already
    /// registered — specs are immutable once known.
    pub fn register(&mut self, spec: PipelineSpec) -> Result<(), RegistryError> {
        if self.pipelines.contains_key(&spec.name) {
            return Err(RegistryError::AlreadyRegistered(spec.name));
        }
        self.pipelines.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PipelineSpec> {
        self.pipelines.get(name)
    }

    /// All registered pipelines whose name starts with `prefix`, in name
    /// order.
    pub fn list_by_prefix(&self, prefix: &str) -> Vec<&PipelineSpec> {
        self.pipelines
            .values()
            .filter(|spec| spec.name.starts_with(prefix))
            .collect()
    }
}

/// Whether a validated call's `file_path` was supplied by the caller or
/// derived from `(tier, week_ending)` (§4.2 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePathMode {
    Explicit,
    Derived,
}

/// The result of running `(pipeline_name, raw_params)` through validation:
/// coerced, defaulted, alias-resolved parameters plus the canonical
/// encoding used to derive `idempotency_key` (§4.2 step 7).
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedCall {
    pub pipeline: String,
    pub params: BTreeMap<String, ParamValue>,
    pub canonical_json: String,
    pub idempotency_key: String,
    pub file_path_mode: Option<FilePathMode>,
    /// Rendered from `spec.concurrency_key_template` against `params`
    /// (§4.4); `None` when the pipeline declares no template, meaning it
    /// allows unlimited concurrent runs.
    pub concurrency_key: Option<String>,
}

/// Run the seven-step validation pipeline (§4.2) for `(pipeline_name,
/// raw_params)`. `caller_idempotency_key` overrides the derived key when
/// present (step 7).
pub fn validate(
    registry: &PipelineRegistry,
    pipeline_name: &str,
    raw_params: &serde_json::Map<String, Value>,
    caller_idempotency_key: Option<String>,
) -> Result<ValidatedCall, RegistryError> {
    let spec = registry
        .get(pipeline_name)
        .ok_or_else(|| RegistryError::PipelineNotFound(pipeline_name.to_string()))?;

    let mut params = BTreeMap::new();
    for def in spec.required_params.iter().chain(spec.optional_params.iter()) {
        match raw_params.get(&def.name) {
            Some(raw) => {
                let aliased = apply_alias(def, raw);
                params.insert(def.name.clone(), coerce(def, &aliased)?);
            }
            None => {
                if let Some(default) = &def.default {
                    params.insert(def.name.clone(), default.clone());
                }
            }
        }
    }

    for def in &spec.required_params {
        if !params.contains_key(&def.name) {
            return Err(RegistryError::ParamMissing {
                field: def.name.clone(),
            });
        }
    }

    let file_path_mode = if spec.is_ingest {
        Some(resolve_ingest_file_path(spec, pipeline_name, raw_params, &mut params)?)
    } else {
        None
    };

    let canonical_json = canonical_json(&params);
    let idempotency_key = caller_idempotency_key
        .unwrap_or_else(|| derive_idempotency_key(pipeline_name, &canonical_json));
    let concurrency_key = render_concurrency_key(spec, &params);

    Ok(ValidatedCall {
        pipeline: pipeline_name.to_string(),
        params,
        canonical_json,
        idempotency_key,
        file_path_mode,
        concurrency_key,
    })
}

/// Substitute `{field}` tokens in `spec.concurrency_key_template` with the
/// corresponding validated param values (§4.4). A token naming a param that
/// wasn't supplied is left unsubstituted rather than failing the call — the
/// template is an operator-authored string, not caller input.
fn render_concurrency_key(spec: &PipelineSpec, params: &BTreeMap<String, ParamValue>) -> Option<String> {
    let template = spec.concurrency_key_template.as_ref()?;
    let mut key = template.clone();
    for (name, value) in params {
        key = key.replace(&format!("{{{name}}}"), &param_value_as_template_str(value));
    }
    Some(key)
}

fn resolve_ingest_file_path(
    spec: &PipelineSpec,
    pipeline_name: &str,
    raw_params: &serde_json::Map<String, Value>,
    params: &mut BTreeMap<String, ParamValue>,
) -> Result<FilePathMode, RegistryError> {
    // `file_path` isn't a declared param for most ingest pipelines, so an
    // explicit caller value never reaches `params` through the declared-defs
    // loop above — check the raw input directly (§4.2 step 6: explicit
    // always wins).
    if let Some(raw) = raw_params.get("file_path") {
        if let Some(path) = raw.as_str() {
            params.insert("file_path".to_string(), ParamValue::String(path.to_string()));
            return Ok(FilePathMode::Explicit);
        }
    }
    if params.contains_key("file_path") {
        return Ok(FilePathMode::Explicit);
    }
    let derivation = spec
        .ingest_derivation
        .as_ref()
        .ok_or_else(|| RegistryError::IngestSourceUnresolved {
            pipeline: pipeline_name.to_string(),
        })?;
    let tier = params.get(&derivation.tier_field);
    let week_ending = params.get(&derivation.week_ending_field);
    match (tier, week_ending) {
        (Some(tier), Some(week_ending)) => {
            let derived = derivation
                .file_path_template
                .replace("{tier}", &param_value_as_template_str(tier))
                .replace(
                    "{week_ending}",
                    &param_value_as_template_str(week_ending),
                );
            params.insert("file_path".to_string(), ParamValue::String(derived));
            Ok(FilePathMode::Derived)
        }
        _ => Err(RegistryError::IngestSourceUnresolved {
            pipeline: pipeline_name.to_string(),
        }),
    }
}

fn param_value_as_template_str(value: &ParamValue) -> String {
    match value {
        ParamValue::String(s) => s.clone(),
        ParamValue::Integer(i) => i.to_string(),
        ParamValue::Boolean(b) => b.to_string(),
        ParamValue::Date(d) => d.format("%Y-%m-%d").to_string(),
    }
}

/// Apply a param's alias map to a string-valued raw input before coercion
/// (§4.2 step 2). Non-string values and unmapped strings pass through
/// unchanged.
fn apply_alias(def: &ParamDef, value: &Value) -> Value {
    match value {
        Value::String(s) => match def.aliases.get(s) {
            Some(mapped) => Value::String(mapped.clone()),
            None => value.clone(),
        },
        other => other.clone(),
    }
}

fn coerce(def: &ParamDef, value: &Value) -> Result<ParamValue, RegistryError> {
    let invalid = |reason: &str| RegistryError::ParamInvalid {
        field: def.name.clone(),
        reason: reason.to_string(),
    };
    match &def.kind {
        ParamKind::String | ParamKind::Path => value
            .as_str()
            .map(|s| ParamValue::String(s.to_string()))
            .ok_or_else(|| invalid("expected a string")),
        ParamKind::Integer => value
            .as_i64()
            .map(ParamValue::Integer)
            .ok_or_else(|| invalid("expected an integer")),
        ParamKind::Boolean => value
            .as_bool()
            .map(ParamValue::Boolean)
            .ok_or_else(|| invalid("expected a boolean")),
        ParamKind::Date => value
            .as_str()
            .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .map(ParamValue::Date)
            .ok_or_else(|| invalid("expected an ISO-8601 date (YYYY-MM-DD)")),
        ParamKind::Enum { values } => {
            let s = value.as_str().ok_or_else(|| invalid("expected a string"))?;
            if values.iter().any(|v| v == s) {
                Ok(ParamValue::String(s.to_string()))
            } else {
                Err(RegistryError::ParamInvalid {
                    field: def.name.clone(),
                    reason: format!("must be one of {values:?}"),
                })
            }
        }
    }
}

fn canonical_json(params: &BTreeMap<String, ParamValue>) -> String {
    serde_json::to_string(params).expect("coerced params always serialize")
}

fn derive_idempotency_key(pipeline_name: &str, canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pipeline_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_json.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingest_spec() -> PipelineSpec {
        PipelineSpec {
            name: "finra.otc.ingest_week".to_string(),
            description: "weekly OTC ingest".to_string(),
            version: "1".to_string(),
            required_params: vec![
                ParamDef {
                    name: "tier".to_string(),
                    kind: ParamKind::Enum {
                        values: vec!["T1".to_string(), "T2".to_string()],
                    },
                    default: None,
                    aliases: BTreeMap::from([("t1".to_string(), "T1".to_string())]),
                },
                ParamDef {
                    name: "week_ending".to_string(),
                    kind: ParamKind::Date,
                    default: None,
                    aliases: BTreeMap::new(),
                },
            ],
            optional_params: vec![ParamDef {
                name: "dry_run".to_string(),
                kind: ParamKind::Boolean,
                default: Some(ParamValue::Boolean(false)),
                aliases: BTreeMap::new(),
            }],
            is_ingest: true,
            ingest_derivation: Some(spine_types::IngestDerivation {
                tier_field: "tier".to_string(),
                week_ending_field: "week_ending".to_string(),
                file_path_template: "/data/{tier}/{week_ending}.csv".to_string(),
            }),
            concurrency_key_template: None,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let err = registry.register(ingest_spec()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn list_by_prefix_filters() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        assert_eq!(registry.list_by_prefix("finra.").len(), 1);
        assert_eq!(registry.list_by_prefix("nasdaq.").len(), 0);
    }

    #[test]
    fn unknown_pipeline_is_not_found() {
        let registry = PipelineRegistry::new();
        let raw = serde_json::Map::new();
        let err = validate(&registry, "missing.pipeline", &raw, None).unwrap_err();
        assert!(matches!(err, RegistryError::PipelineNotFound(_)));
    }

    #[test]
    fn missing_required_param_is_rejected() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw = serde_json::from_value(json!({ "tier": "T1" })).unwrap();
        let err = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ParamMissing { field } if field == "week_ending"
        ));
    }

    #[test]
    fn alias_is_applied_before_enum_coercion() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw =
            serde_json::from_value(json!({ "tier": "t1", "week_ending": "2024-01-05" })).unwrap();
        let call = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
        assert_eq!(call.params.get("tier").unwrap().as_str(), Some("T1"));
    }

    #[test]
    fn invalid_enum_value_is_rejected() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw =
            serde_json::from_value(json!({ "tier": "T9", "week_ending": "2024-01-05" })).unwrap();
        let err = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap_err();
        assert!(matches!(err, RegistryError::ParamInvalid { field, .. } if field == "tier"));
    }

    #[test]
    fn optional_default_is_applied() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw =
            serde_json::from_value(json!({ "tier": "T1", "week_ending": "2024-01-05" })).unwrap();
        let call = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
        assert_eq!(
            call.params.get("dry_run"),
            Some(&ParamValue::Boolean(false))
        );
    }

    #[test]
    fn file_path_is_derived_when_absent() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw =
            serde_json::from_value(json!({ "tier": "T1", "week_ending": "2024-01-05" })).unwrap();
        let call = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
        assert_eq!(call.file_path_mode, Some(FilePathMode::Derived));
        assert_eq!(
            call.params.get("file_path").unwrap().as_str(),
            Some("/data/T1/2024-01-05.csv")
        );
    }

    #[test]
    fn explicit_file_path_wins_over_derivation() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw = serde_json::from_value(json!({
            "tier": "T1",
            "week_ending": "2024-01-05",
            "file_path": "/custom/path.csv"
        }))
        .unwrap();
        let call = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
        assert_eq!(call.file_path_mode, Some(FilePathMode::Explicit));
        assert_eq!(
            call.params.get("file_path").unwrap().as_str(),
            Some("/custom/path.csv")
        );
    }

    #[test]
    fn idempotency_key_is_deterministic_and_overridable() {
        let mut registry = PipelineRegistry::new();
        registry.register(ingest_spec()).unwrap();
        let raw =
            serde_json::from_value(json!({ "tier": "T1", "week_ending": "2024-01-05" })).unwrap();
        let a = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
        let b = validate(&registry, "finra.otc.ingest_week", &raw, None).unwrap();
        assert_eq!(a.idempotency_key, b.idempotency_key);

        let overridden = validate(
            &registry,
            "finra.otc.ingest_week",
            &raw,
            Some("caller-key".to_string()),
        )
        .unwrap();
        assert_eq!(overridden.idempotency_key, "caller-key");
    }
}
