use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{ExportConfig, ExportFormat, HttpMethod, WebhookConfig};
use crate::error::ConfigError;
use evalflow_types::RowResult;

/// Writes each committed row to its destination as it becomes available.
/// File destinations propagate write failures to the caller (the row is
/// retried as a whole); the webhook destination retries once and then
/// swallows, so a flaky endpoint cannot stall commits.
pub enum StreamSink {
    Csv(CsvSink),
    Json(JsonSink),
    Webhook(WebhookSink),
}

impl StreamSink {
    /// Route by the destination tag. `auto` is only meaningful for input
    /// and is rejected here by construction (the config has no such tag).
    pub fn from_config(config: &ExportConfig) -> Result<Self> {
        match config.format {
            ExportFormat::Csv => {
                let path = config
                    .path
                    .clone()
                    .ok_or(ConfigError::MissingExportPath(ExportFormat::Csv))?;
                Ok(StreamSink::Csv(CsvSink::new(path, config.clone())))
            }
            ExportFormat::Json => {
                let path = config
                    .path
                    .clone()
                    .ok_or(ConfigError::MissingExportPath(ExportFormat::Json))?;
                Ok(StreamSink::Json(JsonSink::new(path, config.clone())))
            }
            ExportFormat::Webhook => {
                let webhook = config
                    .webhook
                    .clone()
                    .ok_or(ConfigError::MissingWebhookConfig)?;
                Ok(StreamSink::Webhook(WebhookSink::new(config.clone(), webhook)?))
            }
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        match self {
            StreamSink::Csv(sink) => sink.initialize().await,
            StreamSink::Json(sink) => sink.initialize().await,
            StreamSink::Webhook(_) => Ok(()),
        }
    }

    /// Must complete (including any write-side retry) before returning;
    /// the orchestrator treats the return as acknowledgement.
    pub async fn export_result(&self, row: &RowResult) -> Result<()> {
        match self {
            StreamSink::Csv(sink) => sink.export(row).await,
            StreamSink::Json(sink) => sink.export(row).await,
            StreamSink::Webhook(sink) => sink.export(row).await,
        }
    }

    pub async fn finalize(&self) -> Result<()> {
        match self {
            StreamSink::Json(sink) => sink.finalize().await,
            _ => Ok(()),
        }
    }
}

/// Apply the filter predicate and include/exclude field lists. `None`
/// means the row was filtered out entirely.
pub(crate) fn project_row(row: &RowResult, config: &ExportConfig) -> Result<Option<Value>> {
    if let Some(filter) = &config.filter_condition {
        if !filter(row) {
            return Ok(None);
        }
    }
    let value = serde_json::to_value(row).context("serializing row result")?;
    let Value::Object(mut map) = value else {
        return Err(anyhow!("row result did not serialize to an object"));
    };
    if let Some(include) = &config.include_fields {
        map.retain(|key, _| include.iter().any(|f| f == key));
    }
    for field in &config.exclude_fields {
        map.remove(field);
    }
    Ok(Some(Value::Object(map)))
}

/// Flatten a projected row into ordered CSV columns. Standard input fields
/// get named columns, remaining input fields an `input_` prefix; outcomes
/// flatten per-evaluator (`eval<i>_` prefixes when there is more than one)
/// or collapse into one JSON-encoded `results` column.
pub(crate) fn csv_record(projection: &Map<String, Value>, flatten_outcomes: bool) -> Vec<(String, String)> {
    let mut record: Vec<(String, String)> = Vec::new();

    for key in ["id", "index"] {
        if let Some(v) = projection.get(key) {
            record.push((key.to_string(), scalar(v)));
        }
    }

    if let Some(Value::Object(input)) = projection.get("input") {
        const STANDARD: &[&str] = &[
            "candidate_text",
            "reference_text",
            "source_text",
            "prompt",
            "content_type",
            "language",
        ];
        for key in STANDARD {
            record.push((key.to_string(), input.get(*key).map(scalar).unwrap_or_default()));
        }
        for (key, v) in input {
            if *key == "id" || STANDARD.contains(&key.as_str()) {
                continue;
            }
            record.push((format!("input_{key}"), scalar(v)));
        }
    }

    if let Some(Value::Array(outcomes)) = projection.get("outcomes") {
        if flatten_outcomes {
            let multi = outcomes.len() > 1;
            for (i, outcome) in outcomes.iter().enumerate() {
                let prefix = if multi { format!("eval{}_", i + 1) } else { String::new() };
                for field in ["evaluator", "score", "feedback", "error"] {
                    let v = outcome.get(field).map(scalar).unwrap_or_default();
                    record.push((format!("{prefix}{field}"), v));
                }
                let time = outcome
                    .get("stats")
                    .and_then(|s| s.get("execution_time_ms"))
                    .map(scalar)
                    .unwrap_or_default();
                record.push((format!("{prefix}execution_time_ms"), time));
            }
        } else {
            let encoded = serde_json::to_string(outcomes).unwrap_or_default();
            record.push(("results".to_string(), encoded));
        }
    }

    for key in ["combined_score", "completed_at", "duration_ms", "retry_count", "error"] {
        if let Some(v) = projection.get(key) {
            record.push((key.to_string(), scalar(v)));
        }
    }

    record
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn encode_csv_field(field: &str, delimiter: char) -> String {
    if field.contains(delimiter) || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub(crate) fn encode_csv_line(values: &[String], delimiter: char) -> String {
    let mut line = values
        .iter()
        .map(|v| encode_csv_field(v, delimiter))
        .collect::<Vec<_>>()
        .join(&delimiter.to_string());
    line.push('\n');
    line
}

pub struct CsvSink {
    path: PathBuf,
    config: ExportConfig,
    state: Mutex<CsvSinkState>,
}

struct CsvSinkState {
    file: Option<tokio::fs::File>,
    /// Column order captured from the first exported row.
    header: Option<Vec<String>>,
    header_written: bool,
}

impl CsvSink {
    fn new(path: PathBuf, config: ExportConfig) -> Self {
        Self {
            path,
            config,
            state: Mutex::new(CsvSinkState { file: None, header: None, header_written: false }),
        }
    }

    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let exists = tokio::fs::metadata(&self.path).await.is_ok();
        let append = self.config.append_to_existing && exists;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {:?}", self.path))?;
        state.file = Some(file);
        // An appended file already carries its header.
        state.header_written = append;
        Ok(())
    }

    async fn export(&self, row: &RowResult) -> Result<()> {
        let Some(projection) = project_row(row, &self.config)? else {
            return Ok(());
        };
        let Value::Object(map) = projection else {
            return Err(anyhow!("projection is not an object"));
        };
        let record = csv_record(&map, self.config.flatten_outcomes);

        let mut state = self.state.lock().await;
        let header = state
            .header
            .get_or_insert_with(|| record.iter().map(|(k, _)| k.clone()).collect())
            .clone();

        let mut chunk = String::new();
        if !state.header_written {
            chunk.push_str(&encode_csv_line(&header, ','));
            state.header_written = true;
        }
        let values: Vec<String> = header
            .iter()
            .map(|column| {
                record
                    .iter()
                    .find(|(k, _)| k == column)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            })
            .collect();
        chunk.push_str(&encode_csv_line(&values, ','));

        let file = state.file.as_mut().ok_or_else(|| anyhow!("sink not initialized"))?;
        file.write_all(chunk.as_bytes())
            .await
            .with_context(|| format!("writing {:?}", self.path))?;
        file.flush().await?;
        Ok(())
    }
}

pub struct JsonSink {
    path: PathBuf,
    config: ExportConfig,
    state: Mutex<JsonSinkState>,
}

struct JsonSinkState {
    file: Option<tokio::fs::File>,
    first: bool,
}

impl JsonSink {
    fn new(path: PathBuf, config: ExportConfig) -> Self {
        Self {
            path,
            config,
            state: Mutex::new(JsonSinkState { file: None, first: true }),
        }
    }

    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut file = tokio::fs::File::create(&self.path)
            .await
            .with_context(|| format!("creating {:?}", self.path))?;
        file.write_all(b"[").await?;
        file.flush().await?;
        state.file = Some(file);
        state.first = true;
        Ok(())
    }

    async fn export(&self, row: &RowResult) -> Result<()> {
        let Some(projection) = project_row(row, &self.config)? else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        let separator = if state.first { "\n" } else { ",\n" };
        state.first = false;
        let chunk = format!("{separator}{}", serde_json::to_string(&projection)?);
        let file = state.file.as_mut().ok_or_else(|| anyhow!("sink not initialized"))?;
        file.write_all(chunk.as_bytes())
            .await
            .with_context(|| format!("writing {:?}", self.path))?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(file) = state.file.as_mut() {
            file.write_all(b"\n]\n").await?;
            file.flush().await?;
        }
        Ok(())
    }
}

pub struct WebhookSink {
    config: ExportConfig,
    webhook: WebhookConfig,
    client: Client,
    /// Serializes exports so at most one request is in flight.
    guard: Mutex<()>,
}

impl WebhookSink {
    fn new(config: ExportConfig, webhook: WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(webhook.timeout_ms))
            .build()
            .context("building webhook client")?;
        Ok(Self { config, webhook, client, guard: Mutex::new(()) })
    }

    async fn export(&self, row: &RowResult) -> Result<()> {
        let Some(projection) = project_row(row, &self.config)? else {
            return Ok(());
        };
        let _guard = self.guard.lock().await;
        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "result": projection,
        });

        if let Err(first) = post_json(&self.client, &self.webhook, &payload).await {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(second) = post_json(&self.client, &self.webhook, &payload).await {
                // A dead endpoint must not block the commit pipeline.
                tracing::warn!(
                    "webhook delivery to {} failed after retry: {second:#} (first attempt: {first:#})",
                    self.webhook.url
                );
            }
        }
        Ok(())
    }
}

pub(crate) async fn post_json(client: &Client, webhook: &WebhookConfig, payload: &Value) -> Result<()> {
    let mut request = match webhook.method {
        HttpMethod::Post => client.post(&webhook.url),
        HttpMethod::Put => client.put(&webhook.url),
    };
    for (name, value) in &webhook.headers {
        request = request.header(name, value);
    }
    let response = request
        .json(payload)
        .send()
        .await
        .with_context(|| format!("sending to {}", webhook.url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("{} responded with {status}", webhook.url));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evalflow_types::{EvaluationInput, EvaluatorOutcome, RowResult, ScoreValue};
    use std::sync::Arc;

    fn sample_row(index: usize, outcomes: usize) -> RowResult {
        let mut input = EvaluationInput::new(format!("candidate {index}"));
        input.extra.insert("topic".to_string(), json!("news"));
        RowResult {
            id: format!("row-{index}"),
            index,
            input,
            outcomes: (0..outcomes)
                .map(|i| EvaluatorOutcome::new(format!("eval-{i}"), ScoreValue::Number(90.0), "fine"))
                .collect(),
            combined_score: None,
            completed_at: Utc::now(),
            duration_ms: 12,
            retry_count: 0,
            error: None,
        }
    }

    #[test]
    fn csv_fields_are_escaped() {
        assert_eq!(encode_csv_field("plain", ','), "plain");
        assert_eq!(encode_csv_field("a,b", ','), "\"a,b\"");
        assert_eq!(encode_csv_field("say \"hi\"", ','), "\"say \"\"hi\"\"\"");
        assert_eq!(encode_csv_field("two\nlines", ','), "\"two\nlines\"");
    }

    #[test]
    fn single_evaluator_columns_are_unprefixed() {
        let config = ExportConfig::csv_file("unused.csv");
        let Value::Object(map) = project_row(&sample_row(0, 1), &config).unwrap().unwrap() else {
            panic!("expected object");
        };
        let record = csv_record(&map, true);
        let columns: Vec<&str> = record.iter().map(|(k, _)| k.as_str()).collect();
        assert!(columns.contains(&"score"));
        assert!(columns.contains(&"input_topic"));
        assert!(!columns.iter().any(|c| c.starts_with("eval1_")));
    }

    #[test]
    fn multiple_evaluators_columns_are_prefixed() {
        let config = ExportConfig::csv_file("unused.csv");
        let Value::Object(map) = project_row(&sample_row(0, 2), &config).unwrap().unwrap() else {
            panic!("expected object");
        };
        let record = csv_record(&map, true);
        let columns: Vec<&str> = record.iter().map(|(k, _)| k.as_str()).collect();
        assert!(columns.contains(&"eval1_score"));
        assert!(columns.contains(&"eval2_score"));
    }

    #[test]
    fn unflattened_outcomes_collapse_to_results_column() {
        let config = ExportConfig::csv_file("unused.csv");
        let Value::Object(map) = project_row(&sample_row(0, 2), &config).unwrap().unwrap() else {
            panic!("expected object");
        };
        let record = csv_record(&map, false);
        let results = record.iter().find(|(k, _)| k == "results").unwrap();
        let parsed: Value = serde_json::from_str(&results.1).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn projection_honors_include_exclude_and_filter() {
        let mut config = ExportConfig::json_file("unused.json");
        config.include_fields = Some(vec!["id".to_string(), "index".to_string()]);
        let projected = project_row(&sample_row(3, 1), &config).unwrap().unwrap();
        let map = projected.as_object().unwrap();
        assert_eq!(map.len(), 2);

        let mut config = ExportConfig::json_file("unused.json");
        config.exclude_fields = vec!["input".to_string()];
        let projected = project_row(&sample_row(3, 1), &config).unwrap().unwrap();
        assert!(projected.get("input").is_none());

        let mut config = ExportConfig::json_file("unused.json");
        config.filter_condition = Some(Arc::new(|row: &RowResult| row.index % 2 == 0));
        assert!(project_row(&sample_row(3, 1), &config).unwrap().is_none());
        assert!(project_row(&sample_row(4, 1), &config).unwrap().is_some());
    }

    #[tokio::test]
    async fn csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.csv");
        let config = ExportConfig::csv_file(&path);
        let sink = StreamSink::from_config(&config).unwrap();

        sink.initialize().await.unwrap();
        sink.export_result(&sample_row(0, 1)).await.unwrap();
        sink.export_result(&sample_row(1, 1)).await.unwrap();
        sink.finalize().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,index,candidate_text"));
        assert!(lines[1].starts_with("row-0"));
        assert!(lines[2].starts_with("row-1"));
    }

    #[tokio::test]
    async fn csv_sink_append_mode_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.csv");

        let config = ExportConfig::csv_file(&path);
        let sink = StreamSink::from_config(&config).unwrap();
        sink.initialize().await.unwrap();
        sink.export_result(&sample_row(0, 1)).await.unwrap();

        let mut config = ExportConfig::csv_file(&path);
        config.append_to_existing = true;
        let sink = StreamSink::from_config(&config).unwrap();
        sink.initialize().await.unwrap();
        sink.export_result(&sample_row(1, 1)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3, "one header and two records: {content}");
        assert_eq!(lines.iter().filter(|l| l.starts_with("id,")).count(), 1);
    }

    #[tokio::test]
    async fn json_sink_produces_a_parsable_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        let config = ExportConfig::json_file(&path);
        let sink = StreamSink::from_config(&config).unwrap();

        sink.initialize().await.unwrap();
        sink.export_result(&sample_row(0, 1)).await.unwrap();
        sink.export_result(&sample_row(1, 1)).await.unwrap();
        sink.finalize().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&content).unwrap();
        let rows = parsed.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!("row-0"));
    }

    #[tokio::test]
    async fn missing_path_is_a_config_error() {
        let config = ExportConfig {
            path: None,
            ..ExportConfig::csv_file("never")
        };
        assert!(StreamSink::from_config(&config).is_err());
    }
}
