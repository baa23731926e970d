use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ScrnaseqError;
use crate::experiment::{Experiment, ExperimentKind};

pub const METADATA_FILE: &str = "_bioconductor.json";
pub const DEFAULT_BIOCONDUCTOR_VERSION: &str = "3.19";

/// Anything the schema accepts beyond the named fields goes into `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub title: String,
    pub description: String,
    pub taxonomy_id: Vec<String>,
    pub genome: Vec<String>,
    pub sources: Vec<SourceEntry>,
    pub maintainer_name: String,
    pub maintainer_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bioconductor_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub provider: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SourceEntry {
    pub fn new(provider: &str, id: &str) -> Self {
        Self {
            provider: provider.to_string(),
            id: id.to_string(),
            version: None,
        }
    }
}

pub struct SchemaValidator {
    schema: JSONSchema,
}

impl SchemaValidator {
    pub fn new(schema: &Value) -> Result<Self, ScrnaseqError> {
        let schema = JSONSchema::compile(schema)
            .map_err(|err| ScrnaseqError::Validation(format!("invalid metadata schema: {err}")))?;
        Ok(Self { schema })
    }

    pub fn validate(&self, document: &Value) -> Result<(), ScrnaseqError> {
        if let Err(errors) = self.schema.validate(document) {
            let messages = errors
                .map(|err| {
                    let location = err.instance_path.to_string();
                    if location.is_empty() {
                        err.to_string()
                    } else {
                        format!("{location}: {err}")
                    }
                })
                .collect::<Vec<_>>();
            return Err(ScrnaseqError::Validation(messages.join("; ")));
        }
        Ok(())
    }
}

/// Object-derived block stored under `applications.takane`.
pub fn format_object_metadata(x: &Experiment) -> Value {
    let (rows, columns) = x.shape();
    let mut meta = Map::new();
    meta.insert(
        "summarized_experiment".to_string(),
        json!({
            "rows": rows,
            "columns": columns,
            "assays": x.assay_names(),
            "column_annotations": x.column_annotation_names(),
        }),
    );
    if x.kind() == ExperimentKind::SingleCell {
        meta.insert(
            "single_cell_experiment".to_string(),
            json!({
                "reduced_dimensions": x.reduced_dim_names(),
                "alternative_experiments": x.alternative_experiment_names(),
            }),
        );
    }
    Value::Object(meta)
}

pub fn prepare_document<M: Serialize + ?Sized>(
    metadata: &M,
    bioconductor_version: &str,
) -> Result<Map<String, Value>, ScrnaseqError> {
    let value =
        serde_json::to_value(metadata).map_err(|err| ScrnaseqError::Json(err.to_string()))?;
    let Value::Object(mut document) = value else {
        return Err(ScrnaseqError::Validation(
            "metadata must be a JSON object".to_string(),
        ));
    };
    document
        .entry("bioconductor_version")
        .or_insert_with(|| Value::String(bioconductor_version.to_string()));
    Ok(document)
}

pub fn attach_object_metadata(
    document: &mut Map<String, Value>,
    takane: Value,
) -> Result<(), ScrnaseqError> {
    let applications = document
        .entry("applications")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(applications) = applications else {
        return Err(ScrnaseqError::Validation(
            "'applications' must be a JSON object".to_string(),
        ));
    };
    applications.insert("takane".to_string(), takane);
    Ok(())
}
