use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::mask::mask_sensitive;

/// Append-only JSON conversation logs: one scrubbed file per LLM call,
/// named `YYYYMMDD_HHMMSS-{agent}-{8hex}.json`. Advisory only; the SQLite
/// store is the source of truth.
pub struct ConversationLogger {
    dir: PathBuf,
}

/// Aggregates over the last 24 hours of conversation logs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
    pub by_agent: BTreeMap<String, u64>,
    pub by_model: BTreeMap<String, u64>,
}

impl ConversationLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one scrubbed record; returns the file name. Prompt and
    /// response fields are masked before serialization.
    #[instrument(skip(self, record))]
    pub fn write(&self, record: &serde_json::Value) -> std::io::Result<String> {
        std::fs::create_dir_all(&self.dir)?;

        let mut record = record.clone();
        for field in ["prompt", "response"] {
            if let Some(value) = record.get(field).and_then(|v| v.as_str()) {
                let masked = mask_sensitive(value);
                record[field] = serde_json::Value::String(masked);
            }
        }

        let agent = record
            .get("agent")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let unique = uuid::Uuid::now_v7().simple().to_string();
        let filename = format!("{stamp}-{agent}-{}.json", &unique[..8]);

        let path = self.dir.join(&filename);
        let body = serde_json::to_string_pretty(&record)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(&path, body)?;
        Ok(filename)
    }

    /// Most recent records, newest first, by file modification time.
    pub fn read_logs(&self, limit: usize) -> Vec<serde_json::Value> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((mtime, path))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0));

        files
            .into_iter()
            .take(limit)
            .filter_map(|(_, path)| {
                let raw = std::fs::read_to_string(&path).ok()?;
                match serde_json::from_str::<serde_json::Value>(&raw) {
                    Ok(mut value) => {
                        let filename = path.file_name()?.to_string_lossy().into_owned();
                        if let Some(obj) = value.as_object_mut() {
                            obj.insert("filename".into(), serde_json::Value::String(filename));
                        }
                        Some(value)
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable log file");
                        None
                    }
                }
            })
            .collect()
    }

    /// Request count, tokens, cost and average duration over the last 24h,
    /// with per-agent and per-model request breakdowns.
    pub fn metrics_24h(&self) -> Metrics {
        let cutoff = Utc::now() - Duration::hours(24);
        let logs = self.read_logs(1000);

        let mut metrics = Metrics::default();
        let mut duration_sum = 0.0;
        let mut duration_count = 0u64;

        for log in logs {
            let in_window = log
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc) >= cutoff)
                // Records without a parseable timestamp stay in the window.
                .unwrap_or(true);
            if !in_window {
                continue;
            }

            metrics.total_requests += 1;
            metrics.total_tokens += log
                .get("total_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            metrics.total_cost_usd += log
                .get("estimated_cost_usd")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if let Some(d) = log.get("duration_ms").and_then(|v| v.as_f64()) {
                duration_sum += d;
                duration_count += 1;
            }
            if let Some(agent) = log.get("agent").and_then(|v| v.as_str()) {
                *metrics.by_agent.entry(agent.to_string()).or_default() += 1;
            }
            if let Some(model) = log.get("model").and_then(|v| v.as_str()) {
                *metrics.by_model.entry(model.to_string()).or_default() += 1;
            }
        }

        if duration_count > 0 {
            metrics.avg_duration_ms = duration_sum / duration_count as f64;
        }
        metrics
    }
}
