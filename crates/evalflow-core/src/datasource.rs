use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{CsvOptions, InputFormat, JsonOptions};
use crate::error::ConfigError;
use evalflow_types::EvaluationInput;

/// Yields a finite ordered sequence of input rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn load(&self) -> Result<Vec<EvaluationInput>>;

    /// Human-readable origin, echoed into state snapshots.
    fn describe(&self) -> Option<String> {
        None
    }
}

pub struct VecRowSource {
    rows: Vec<EvaluationInput>,
}

impl VecRowSource {
    pub fn new(rows: Vec<EvaluationInput>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for VecRowSource {
    async fn load(&self) -> Result<Vec<EvaluationInput>> {
        Ok(self.rows.clone())
    }
}

/// Select a parser for `path`. `Auto` resolves by extension: `.csv`/`.tsv`
/// are delimited text, `.json` is a structured document.
pub fn source_for_path(
    path: impl Into<PathBuf>,
    format: InputFormat,
    csv: CsvOptions,
    json: JsonOptions,
) -> Result<Arc<dyn RowSource>> {
    let path = path.into();
    let resolved = match format {
        InputFormat::Auto => match path.extension().and_then(|e| e.to_str()) {
            Some("csv") | Some("tsv") => InputFormat::Csv,
            Some("json") => InputFormat::Json,
            _ => return Err(ConfigError::UndetectableFormat(path).into()),
        },
        other => other,
    };
    Ok(match resolved {
        InputFormat::Csv => Arc::new(CsvRowSource::new(path, csv)),
        InputFormat::Json => Arc::new(JsonRowSource::new(path, json)),
        InputFormat::Auto => unreachable!("auto is resolved above"),
    })
}

const SEMANTIC_FIELDS: &[&str] = &[
    "candidate_text",
    "reference_text",
    "source_text",
    "prompt",
    "content_type",
    "language",
    "id",
];

/// Delimited-text input. Quoted fields may span lines; quotes are escaped
/// by doubling, or by the configured escape character.
pub struct CsvRowSource {
    path: PathBuf,
    options: CsvOptions,
}

impl CsvRowSource {
    pub fn new(path: impl Into<PathBuf>, options: CsvOptions) -> Self {
        Self { path: path.into(), options }
    }
}

#[async_trait]
impl RowSource for CsvRowSource {
    async fn load(&self) -> Result<Vec<EvaluationInput>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;

        let mut records = parse_delimited(&content, &self.options);
        if self.options.skip_empty_lines {
            records.retain(|r| !(r.len() == 1 && r[0].is_empty()));
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let headers: Vec<String> = if self.options.has_headers {
            records.remove(0)
        } else {
            (0..records[0].len()).map(|i| i.to_string()).collect()
        };

        let mut rows = Vec::with_capacity(records.len());
        for (row_idx, record) in records.iter().enumerate() {
            let mut input = EvaluationInput::default();
            let mut has_candidate = false;
            for (col, raw) in record.iter().enumerate() {
                let column = headers.get(col).cloned().unwrap_or_else(|| col.to_string());
                let name = self
                    .options
                    .field_map
                    .get(&column)
                    .cloned()
                    .unwrap_or(column);
                match name.as_str() {
                    "candidate_text" => {
                        input.candidate_text = raw.clone();
                        has_candidate = true;
                    }
                    "reference_text" => input.reference_text = non_empty(raw),
                    "source_text" => input.source_text = non_empty(raw),
                    "prompt" => input.prompt = non_empty(raw),
                    "content_type" => input.content_type = non_empty(raw),
                    "language" => input.language = non_empty(raw),
                    "id" => input.id = non_empty(raw),
                    _ => {
                        input.extra.insert(name, Value::String(raw.clone()));
                    }
                }
            }
            if !has_candidate {
                return Err(ConfigError::MissingField {
                    row: row_idx,
                    field: "candidate_text".to_string(),
                }
                .into());
            }
            rows.push(input);
        }
        Ok(rows)
    }

    fn describe(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_delimited(content: &str, options: &CsvOptions) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if Some(c) == options.escape && chars.peek().is_some() {
                // Escaped character inside a quoted field.
                if let Some(escaped) = chars.next() {
                    field.push(escaped);
                }
            } else if c == options.quote {
                if options.escape.is_none() && chars.peek() == Some(&options.quote) {
                    chars.next();
                    field.push(options.quote);
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == options.quote && field.is_empty() {
            in_quotes = true;
        } else if c == options.delimiter {
            record.push(std::mem::take(&mut field));
        } else if c == '\n' {
            if field.ends_with('\r') {
                field.pop();
            }
            record.push(std::mem::take(&mut field));
            records.push(std::mem::take(&mut record));
        } else {
            field.push(c);
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

/// Structured-document input: the root is an array, or `root_path` is a
/// dotted path resolving to one; each element must be a keyed aggregate.
pub struct JsonRowSource {
    path: PathBuf,
    options: JsonOptions,
}

impl JsonRowSource {
    pub fn new(path: impl Into<PathBuf>, options: JsonOptions) -> Self {
        Self { path: path.into(), options }
    }
}

#[async_trait]
impl RowSource for JsonRowSource {
    async fn load(&self) -> Result<Vec<EvaluationInput>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let root: Value = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {:?}", self.path))?;

        let array = match &self.options.root_path {
            None => &root,
            Some(dotted) => resolve_path(&root, dotted).ok_or_else(|| {
                anyhow!("path `{}` not found in {:?}", dotted, self.path)
            })?,
        };

        let elements = array.as_array().ok_or_else(|| {
            anyhow::Error::from(ConfigError::InvalidInput {
                path: self.path.clone(),
                detail: "expected an array of row objects".to_string(),
            })
        })?;

        let mut rows = Vec::with_capacity(elements.len());
        for (idx, element) in elements.iter().enumerate() {
            if !element.is_object() {
                return Err(ConfigError::InvalidInput {
                    path: self.path.clone(),
                    detail: format!("element {} is not an object", idx),
                }
                .into());
            }
            let input: EvaluationInput = serde_json::from_value(element.clone())
                .with_context(|| format!("element {} of {:?}", idx, self.path))?;
            rows.push(input);
        }
        Ok(rows)
    }

    fn describe(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

fn resolve_path<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn csv_source(content: &str, options: CsvOptions) -> CsvRowSource {
        let mut file = tempfile::NamedTempFile::with_suffix(".csv").unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let (_, path) = file.keep().unwrap();
        CsvRowSource::new(path, options)
    }

    #[tokio::test]
    async fn csv_basic_with_headers() {
        let source = csv_source(
            "id,candidate_text,reference_text,topic\nr1,hello,hi,greeting\nr2,bye,bye,farewell\n",
            CsvOptions::default(),
        );
        let rows = source.load().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.as_deref(), Some("r1"));
        assert_eq!(rows[0].candidate_text, "hello");
        assert_eq!(rows[0].reference_text.as_deref(), Some("hi"));
        assert_eq!(rows[0].extra["topic"], Value::String("greeting".to_string()));
    }

    #[tokio::test]
    async fn csv_quoted_fields() {
        let source = csv_source(
            "candidate_text,reference_text\n\"a, b\",\"say \"\"hi\"\"\"\n",
            CsvOptions::default(),
        );
        let rows = source.load().await.unwrap();
        assert_eq!(rows[0].candidate_text, "a, b");
        assert_eq!(rows[0].reference_text.as_deref(), Some("say \"hi\""));
    }

    #[tokio::test]
    async fn csv_escape_character() {
        let options = CsvOptions { escape: Some('\\'), ..CsvOptions::default() };
        let source = csv_source("candidate_text\n\"a \\\" b\"\n", options);
        let rows = source.load().await.unwrap();
        assert_eq!(rows[0].candidate_text, "a \" b");
    }

    #[tokio::test]
    async fn csv_headerless_with_field_map() {
        let mut options = CsvOptions { has_headers: false, ..CsvOptions::default() };
        options.field_map.insert("0".to_string(), "candidate_text".to_string());
        options.field_map.insert("1".to_string(), "reference_text".to_string());
        let source = csv_source("hello,hi\n", options);
        let rows = source.load().await.unwrap();
        assert_eq!(rows[0].candidate_text, "hello");
        assert_eq!(rows[0].reference_text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn csv_skips_empty_lines() {
        let source = csv_source(
            "candidate_text\nfirst\n\nsecond\n\n",
            CsvOptions::default(),
        );
        let rows = source.load().await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn csv_missing_candidate_is_config_error() {
        let source = csv_source("reference_text\nonly-a-reference\n", CsvOptions::default());
        let err = source.load().await.unwrap_err();
        assert!(err.to_string().contains("candidate_text"));
    }

    #[tokio::test]
    async fn json_root_array() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(br#"[{"candidate_text": "a"}, {"candidate_text": "b", "id": "x"}]"#)
            .unwrap();
        let (_, path) = file.keep().unwrap();
        let rows = JsonRowSource::new(path, JsonOptions::default()).load().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn json_dotted_path() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(br#"{"data": {"rows": [{"candidate_text": "a"}]}}"#).unwrap();
        let (_, path) = file.keep().unwrap();
        let options = JsonOptions { root_path: Some("data.rows".to_string()) };
        let rows = JsonRowSource::new(path, options).load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].candidate_text, "a");
    }

    #[tokio::test]
    async fn json_non_array_root_is_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(br#"{"candidate_text": "a"}"#).unwrap();
        let (_, path) = file.keep().unwrap();
        let err = JsonRowSource::new(path, JsonOptions::default()).load().await.unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn auto_format_detection() {
        assert!(source_for_path("x.csv", InputFormat::Auto, CsvOptions::default(), JsonOptions::default()).is_ok());
        assert!(source_for_path("x.json", InputFormat::Auto, CsvOptions::default(), JsonOptions::default()).is_ok());
        assert!(source_for_path("x.parquet", InputFormat::Auto, CsvOptions::default(), JsonOptions::default()).is_err());
    }
}
