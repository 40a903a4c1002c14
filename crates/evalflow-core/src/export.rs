use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{ExportConfig, ExportFormat};
use crate::error::ConfigError;
use crate::sink::{csv_record, encode_csv_line, post_json, project_row};
use evalflow_types::RowResult;

/// Post-hoc bulk export of accumulated results. Unlike the streaming sink,
/// failures here always propagate to the caller.
pub async fn export_results(results: &[RowResult], config: &ExportConfig) -> Result<()> {
    match config.format {
        ExportFormat::Csv => export_csv(results, config).await,
        ExportFormat::Json => export_json(results, config).await,
        ExportFormat::Webhook => export_webhook(results, config).await,
    }
}

async fn export_csv(results: &[RowResult], config: &ExportConfig) -> Result<()> {
    let path = config
        .path
        .clone()
        .ok_or(ConfigError::MissingExportPath(ExportFormat::Csv))?;

    let mut records = Vec::new();
    for row in results {
        if let Some(Value::Object(map)) = project_row(row, config)? {
            records.push(csv_record(&map, config.flatten_outcomes));
        }
    }

    let exists = tokio::fs::metadata(&path).await.is_ok();
    let append = config.append_to_existing && exists;

    let header: Vec<String> = records
        .first()
        .map(|r| r.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default();

    let mut out = String::new();
    if !append && !header.is_empty() {
        out.push_str(&encode_csv_line(&header, ','));
    }
    for record in &records {
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
        out.push_str(&encode_csv_line(&values, ','));
    }

    if append {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {path:?}"))?;
        file.write_all(out.as_bytes()).await?;
        file.flush().await?;
    } else {
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("writing {path:?}"))?;
    }
    Ok(())
}

async fn export_json(results: &[RowResult], config: &ExportConfig) -> Result<()> {
    let path = config
        .path
        .clone()
        .ok_or(ConfigError::MissingExportPath(ExportFormat::Json))?;

    let mut projections = Vec::with_capacity(results.len());
    for row in results {
        if let Some(projection) = project_row(row, config)? {
            projections.push(projection);
        }
    }
    let body = serde_json::to_string_pretty(&projections)?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("writing {path:?}"))?;
    Ok(())
}

async fn export_webhook(results: &[RowResult], config: &ExportConfig) -> Result<()> {
    let webhook = config
        .webhook
        .clone()
        .ok_or(ConfigError::MissingWebhookConfig)?;
    let client = Client::builder()
        .timeout(Duration::from_millis(webhook.timeout_ms))
        .build()
        .context("building webhook client")?;

    let mut projections = Vec::with_capacity(results.len());
    for row in results {
        if let Some(projection) = project_row(row, config)? {
            projections.push(projection);
        }
    }

    let batch_size = webhook.batch_size.max(1);
    for chunk in projections.chunks(batch_size) {
        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "results": chunk,
            "count": chunk.len(),
        });
        post_json(&client, &webhook, &payload)
            .await
            .context("bulk webhook export")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use chrono::Utc;
    use evalflow_types::{EvaluationInput, EvaluatorOutcome, ScoreValue};

    fn rows(n: usize) -> Vec<RowResult> {
        (0..n)
            .map(|index| RowResult {
                id: format!("row-{index}"),
                index,
                input: EvaluationInput::new(format!("candidate {index}")),
                outcomes: vec![EvaluatorOutcome::new("exact_match", ScoreValue::Number(90.0), "ok")],
                combined_score: None,
                completed_at: Utc::now(),
                duration_ms: 10,
                retry_count: 0,
                error: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn json_export_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let config = ExportConfig::json_file(&path);

        export_results(&rows(3), &config).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let back: Vec<RowResult> = serde_json::from_str(&content).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[2].id, "row-2");
        assert_eq!(back[2].outcomes[0].score, ScoreValue::Number(90.0));
    }

    #[tokio::test]
    async fn csv_export_then_append_keeps_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let config = ExportConfig::csv_file(&path);
        export_results(&rows(2), &config).await.unwrap();

        let mut config = ExportConfig::csv_file(&path);
        config.append_to_existing = true;
        export_results(&rows(2), &config).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5, "one header plus four records: {content}");
        assert_eq!(lines.iter().filter(|l| l.starts_with("id,")).count(), 1);
    }

    #[tokio::test]
    async fn webhook_export_failure_propagates() {
        // Nothing listens on this port; the connection error must surface.
        let config = ExportConfig::webhook(WebhookConfig {
            url: "http://127.0.0.1:9/hook".to_string(),
            method: Default::default(),
            headers: Default::default(),
            timeout_ms: 1_000,
            batch_size: 10,
        });
        assert!(export_results(&rows(1), &config).await.is_err());
    }
}
