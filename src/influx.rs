//! InfluxDB v2 client: line protocol encoding and the HTTP write session.
//!
//! Points are serialized as
//! `measurement,tag=val field=val timestamp_ns` and POSTed to
//! `/api/v2/write` with nanosecond precision. All writes in this process use
//! that one precision.

use crate::pipeline::excerpt;
use crate::state::{BridgeStats, ConnectionState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("influxdb session is not ready")]
    NotReady,
    #[error("influxdb write timed out")]
    Timeout,
    #[error("influxdb rejected batch (status {status}): {body}")]
    BatchRejected { status: u16, body: String },
    #[error("influxdb transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

impl FieldValue {
    fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{v}"),
            FieldValue::Text(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            }
        }
    }
}

/// One timestamped record ready for storage. Tag and field keys are unique;
/// setting an existing key replaces its value.
#[derive(Debug, Clone)]
pub struct SeriesPoint {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: DateTime<Utc>,
}

impl SeriesPoint {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        if let Some(entry) = self.tags.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.tags.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn float_field(mut self, key: &str, value: f64) -> Self {
        self.set_field(key, FieldValue::Float(value));
        self
    }

    pub fn text_field(mut self, key: &str, value: &str) -> Self {
        self.set_field(key, FieldValue::Text(value.to_string()));
        self
    }

    fn set_field(&mut self, key: &str, value: FieldValue) {
        if let Some(entry) = self.fields.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.fields.push((key.to_string(), value));
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// A point without fields carries no value and must not be written.
    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Render as one line of InfluxDB line protocol, tags sorted by key for
    /// canonical form, timestamp in nanoseconds.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_name(&self.measurement);

        let mut sorted_tags: Vec<_> = self.tags.iter().collect();
        sorted_tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in sorted_tags {
            line.push(',');
            line.push_str(&escape_name(key));
            line.push('=');
            line.push_str(&escape_name(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_name(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(
            &self
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        );
        line
    }
}

/// Commas, equals signs and spaces must be backslash-escaped in measurement
/// names, tag keys/values and field keys.
fn escape_name(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Persistent write session against one InfluxDB org/bucket. `connect` probes
/// the health endpoint and flips the shared database state to Connected;
/// `write` refuses to touch the network while the session is not ready.
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: String,
    health_url: String,
    token: String,
    org: String,
    bucket: String,
    stats: Arc<BridgeStats>,
}

impl InfluxWriter {
    pub fn new(
        url: &str,
        token: &str,
        org: &str,
        bucket: &str,
        write_timeout: Duration,
        stats: Arc<BridgeStats>,
    ) -> Result<Self, WriteError> {
        let client = reqwest::Client::builder()
            .timeout(write_timeout)
            .build()
            .map_err(|err| WriteError::Transport(err.to_string()))?;
        let base = url.trim_end_matches('/');
        Ok(Self {
            client,
            write_url: format!("{base}/api/v2/write"),
            health_url: format!("{base}/health"),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            stats,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.stats.database.is_connected()
    }

    /// A session that has been brought up stays retry-eligible after write
    /// failures; `NotReady` is reserved for a session never established.
    fn session_established(&self) -> bool {
        matches!(
            self.stats.database.get(),
            ConnectionState::Connected | ConnectionState::Failed
        )
    }

    pub async fn connect(&self) -> Result<(), WriteError> {
        self.stats.database.set(ConnectionState::Connecting);
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|err| {
                self.stats.database.set(ConnectionState::Failed);
                classify(err)
            })?;
        if !response.status().is_success() {
            self.stats.database.set(ConnectionState::Failed);
            return Err(WriteError::Transport(format!(
                "health check returned status {}",
                response.status()
            )));
        }
        self.stats.database.set(ConnectionState::Connected);
        Ok(())
    }

    /// Submit points as one batch. The v2 write endpoint accepts or rejects a
    /// request as a whole, so a rejected batch fails the call with
    /// `BatchRejected`; failed batches are logged in full (truncated) rather
    /// than silently dropped. Write outcomes drive the session state: a
    /// transport or timeout failure flips it to Failed, any server response
    /// restores Connected.
    pub async fn write(&self, points: &[SeriesPoint]) -> Result<(), WriteError> {
        if !self.session_established() {
            tracing::warn!(count = points.len(), "influxdb not ready; skipping write");
            return Err(WriteError::NotReady);
        }

        let lines: Vec<String> = points
            .iter()
            .filter(|point| {
                if !point.has_fields() {
                    tracing::warn!(measurement = %point.measurement(), "dropping point without fields");
                    return false;
                }
                true
            })
            .map(SeriesPoint::to_line_protocol)
            .collect();
        if lines.is_empty() {
            return Ok(());
        }
        let body = lines.join("\n");

        let result = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.stats.database.set(ConnectionState::Failed);
                let err = classify(err);
                tracing::warn!(error = %err, lines = %excerpt(&body, 512), "dead-letter: batch not written");
                return Err(err);
            }
        };

        // The server answered, so the transport is healthy again.
        self.stats.database.set(ConnectionState::Connected);

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let err = WriteError::BatchRejected {
                status: status.as_u16(),
                body: excerpt(&detail, 256),
            };
            tracing::warn!(error = %err, lines = %excerpt(&body, 512), "dead-letter: batch rejected");
            return Err(err);
        }

        tracing::debug!(count = lines.len(), "wrote points to influxdb");
        Ok(())
    }
}

fn classify(err: reqwest::Error) -> WriteError {
    if err.is_timeout() {
        WriteError::Timeout
    } else {
        WriteError::Transport(err.to_string())
    }
}
