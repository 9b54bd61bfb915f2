use crate::influx::InfluxWriter;
use crate::mapper::map_reading;
use crate::state::BridgeStats;
use crate::telemetry::decode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Per-message pipeline: decode, map, write. Invoked synchronously from the
/// MQTT poll loop so messages are handled one at a time in arrival order; a
/// failing message is logged and never tears the loop down.
pub struct MessagePipeline {
    writer: Arc<InfluxWriter>,
    stats: Arc<BridgeStats>,
    device_id: String,
}

impl MessagePipeline {
    pub fn new(writer: Arc<InfluxWriter>, stats: Arc<BridgeStats>, device_id: String) -> Self {
        Self {
            writer,
            stats,
            device_id,
        }
    }

    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let reading = match decode(payload) {
            Ok(reading) => reading,
            Err(err) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::warn!(
                    topic,
                    payload = %truncate_payload(payload),
                    error = %err,
                    "failed to decode payload"
                );
                return;
            }
        };
        for err in &reading.mismatches {
            self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            self.stats.record_error(err.to_string());
            tracing::warn!(topic, error = %err, "skipping unreadable field");
        }

        let points = map_reading(&reading, &self.device_id);
        if points.is_empty() {
            tracing::trace!(topic, "payload carried no recognized readings");
            return;
        }

        let count = points.len() as u64;
        match self.writer.write(&points).await {
            Ok(()) => {
                self.stats.points_written.fetch_add(count, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(topic, count, "forwarded reading to influxdb");
            }
            Err(err) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::warn!(topic, error = %err, "failed to write points");
            }
        }
    }
}

/// Char-boundary-safe excerpt for log fields.
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

fn truncate_payload(payload: &[u8]) -> String {
    excerpt(&String::from_utf8_lossy(payload), 256)
}
