use crate::influx::SeriesPoint;
use crate::telemetry::DecodedReading;
use chrono::Utc;

pub const DEFAULT_UNIT: &str = "celsius";

/// Map one decoded reading onto series points: every recognized numeric
/// reading becomes its own measurement with a single `value` field, tagged
/// with the static device id (temperature also carries its unit). The source
/// timestamp is used when present, otherwise the point is stamped now; a
/// missing reading simply produces no point.
pub fn map_reading(reading: &DecodedReading, device_id: &str) -> Vec<SeriesPoint> {
    let stamp = reading.timestamp.unwrap_or_else(Utc::now);
    let mut points = Vec::with_capacity(2);

    if let Some(value) = reading.temperature {
        let unit = reading.unit.as_deref().unwrap_or(DEFAULT_UNIT);
        points.push(
            SeriesPoint::new("temperature", stamp)
                .tag("device", device_id)
                .tag("unit", unit)
                .float_field("value", value),
        );
    }
    if let Some(value) = reading.humidity {
        points.push(
            SeriesPoint::new("humidity", stamp)
                .tag("device", device_id)
                .float_field("value", value),
        );
    }

    points
}

#[cfg(test)]
mod tests {
    use super::map_reading;
    use crate::telemetry::{decode, DecodedReading};
    use chrono::{TimeZone, Utc};

    #[test]
    fn full_reading_maps_to_two_points() {
        let reading =
            decode(br#"{"temperature": 23.5, "humidity": 60, "unit": "fahrenheit"}"#).expect("decoded");
        let points = map_reading(&reading, "ESP32");
        assert_eq!(points.len(), 2);

        let temperature = points[0].to_line_protocol();
        assert!(temperature.starts_with("temperature,device=ESP32,unit=fahrenheit value=23.5 "));
        let humidity = points[1].to_line_protocol();
        assert!(humidity.starts_with("humidity,device=ESP32 value=60 "));
    }

    #[test]
    fn humidity_only_maps_to_one_point() {
        let reading = decode(br#"{"humidity": 60}"#).expect("decoded");
        let points = map_reading(&reading, "ESP32");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement(), "humidity");
    }

    #[test]
    fn temperature_defaults_to_celsius() {
        let reading = decode(br#"{"temperature": 20.0}"#).expect("decoded");
        let points = map_reading(&reading, "ESP32");
        assert!(points[0]
            .to_line_protocol()
            .starts_with("temperature,device=ESP32,unit=celsius "));
    }

    #[test]
    fn empty_reading_maps_to_no_points() {
        let points = map_reading(&DecodedReading::default(), "ESP32");
        assert!(points.is_empty());
    }

    #[test]
    fn source_timestamp_is_preserved() {
        let reading =
            decode(br#"{"humidity": 1, "timestamp": "2026-08-27T10:00:00Z"}"#).expect("decoded");
        let points = map_reading(&reading, "ESP32");
        let expected_ns = Utc
            .with_ymd_and_hms(2026, 8, 27, 10, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        assert!(points[0]
            .to_line_protocol()
            .ends_with(&format!(" {expected_ns}")));
    }

    #[test]
    fn points_without_source_timestamp_are_stamped_at_mapping_time() {
        let before = Utc::now().timestamp_nanos_opt().unwrap();
        let reading = decode(br#"{"humidity": 1}"#).expect("decoded");
        let points = map_reading(&reading, "ESP32");
        let line = points[0].to_line_protocol();
        let stamp: i64 = line.rsplit(' ').next().unwrap().parse().unwrap();
        let after = Utc::now().timestamp_nanos_opt().unwrap();
        assert!(stamp >= before && stamp <= after);
    }
}
