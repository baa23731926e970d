use camino::Utf8Path;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::DEFAULT_PACKAGE;
use crate::error::ScrnaseqError;
use crate::search::{SearchQuery, search_filter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub name: String,
    pub version: String,
    pub path: Option<String>,
    /// Only reported when every version is listed.
    pub latest: Option<bool>,
    pub object: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub taxonomy_id: Vec<String>,
    pub genome: Vec<String>,
    pub rows: Option<u64>,
    pub columns: Option<u64>,
    pub assays: Vec<String>,
    pub column_annotations: Vec<String>,
    pub reduced_dimensions: Vec<String>,
    pub alternative_experiments: Vec<String>,
    pub bioconductor_version: Option<String>,
    pub maintainer_name: Option<String>,
    pub maintainer_email: Option<String>,
    pub sources: Vec<SourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub provider: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
}

pub struct Catalog {
    conn: Connection,
    project: String,
}

struct RawRow {
    meta: Option<String>,
    asset: String,
    version: String,
    path: String,
    latest: Option<i64>,
}

impl Catalog {
    pub fn open(path: &Utf8Path) -> Result<Self, ScrnaseqError> {
        let conn = Connection::open_with_flags(path.as_std_path(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| ScrnaseqError::Database(format!("{path}: {err}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            project: DEFAULT_PACKAGE.to_string(),
        }
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = project.to_string();
        self
    }

    pub fn list_datasets(&self, latest: bool) -> Result<Vec<DatasetRecord>, ScrnaseqError> {
        self.query(None, latest)
    }

    pub fn search_datasets(
        &self,
        query: &SearchQuery,
        latest: bool,
    ) -> Result<Vec<DatasetRecord>, ScrnaseqError> {
        self.query(Some(query), latest)
    }

    fn query(
        &self,
        query: Option<&SearchQuery>,
        latest: bool,
    ) -> Result<Vec<DatasetRecord>, ScrnaseqError> {
        let mut sql = String::from(
            "SELECT json_extract(metadata, '$') AS meta, versions.asset AS asset, \
             versions.version AS version, path",
        );
        if !latest {
            sql.push_str(", versions.latest AS latest");
        }
        sql.push_str(
            " FROM paths LEFT JOIN versions ON paths.vid = versions.vid \
             WHERE versions.project = ?",
        );
        if latest {
            sql.push_str(" AND versions.latest = 1");
        }

        let mut parameters = vec![self.project.clone()];
        if let Some(filter) = query.and_then(search_filter) {
            sql.push_str(" AND ");
            sql.push_str(&filter.clause);
            parameters.extend(filter.parameters);
        }
        debug!(sql = %sql, "querying metadata index");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| ScrnaseqError::Database(err.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(parameters.iter()), |row| {
                Ok(RawRow {
                    meta: row.get(0)?,
                    asset: row.get(1)?,
                    version: row.get(2)?,
                    path: row.get(3)?,
                    latest: if latest { None } else { row.get(4)? },
                })
            })
            .map_err(|err| ScrnaseqError::Database(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ScrnaseqError::Database(err.to_string()))?;

        rows.into_iter().map(|row| flatten_row(row, latest)).collect()
    }
}

fn flatten_row(row: RawRow, latest: bool) -> Result<DatasetRecord, ScrnaseqError> {
    let meta: Value = match &row.meta {
        Some(text) => {
            serde_json::from_str(text).map_err(|err| ScrnaseqError::Json(err.to_string()))?
        }
        None => Value::Null,
    };
    let takane = meta.pointer("/applications/takane");
    let from_takane = |pointer: &str| takane.and_then(|value| value.pointer(pointer));

    Ok(DatasetRecord {
        name: row.asset,
        version: row.version,
        path: row.path.rsplit_once('/').map(|(dir, _)| dir.to_string()),
        latest: if latest {
            None
        } else {
            Some(row.latest.is_some_and(|flag| flag != 0))
        },
        object: from_takane("/type").and_then(scalar_string),
        title: meta.get("title").and_then(scalar_string),
        description: meta.get("description").and_then(scalar_string),
        taxonomy_id: string_list(meta.get("taxonomy_id")),
        genome: string_list(meta.get("genome")),
        rows: from_takane("/summarized_experiment/rows").and_then(Value::as_u64),
        columns: from_takane("/summarized_experiment/columns").and_then(Value::as_u64),
        assays: string_list(from_takane("/summarized_experiment/assays")),
        column_annotations: string_list(from_takane("/summarized_experiment/column_annotations")),
        reduced_dimensions: string_list(from_takane("/single_cell_experiment/reduced_dimensions")),
        alternative_experiments: string_list(from_takane(
            "/single_cell_experiment/alternative_experiments",
        )),
        bioconductor_version: meta.get("bioconductor_version").and_then(scalar_string),
        maintainer_name: meta.get("maintainer_name").and_then(scalar_string),
        maintainer_email: meta.get("maintainer_email").and_then(scalar_string),
        sources: meta
            .get("sources")
            .and_then(Value::as_array)
            .map(|sources| {
                sources
                    .iter()
                    .map(|source| SourceRecord {
                        provider: source.get("provider").and_then(scalar_string),
                        id: source.get("id").and_then(scalar_string),
                        version: source.get("version").and_then(scalar_string),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(other) => scalar_string(other).into_iter().collect(),
        None => Vec::new(),
    }
}
