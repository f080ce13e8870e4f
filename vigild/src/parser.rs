// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decodes one line of the detector's structured-log stream.

use serde_json::Value;
use vigil_common::event::MAX_ADDR_LEN;
use vigil_common::{
    DetectorStats, Error, EventKind, Metadata, Protocol, SecurityEvent, Severity, Timestamp,
};

/// Outcome of parsing one frame. Stats frames never reach the event queue;
/// flow frames carry no security finding and are discarded.
#[derive(Clone, Debug, PartialEq)]
pub enum Parsed {
    Event(SecurityEvent),
    Stats(DetectorStats),
    Skip,
}

pub fn parse(line: &str) -> Result<Parsed, Error> {
    let root: Value =
        serde_json::from_str(line).map_err(|e| Error::Parse(format!("invalid json: {e}")))?;

    let event_type = root
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Parse("missing event_type".to_owned()))?;

    match event_type {
        "stats" => parse_stats(&root).map(Parsed::Stats),
        "alert" => parse_alert(&root).map(Parsed::Event),
        "anomaly" => Ok(Parsed::Event(parse_anomaly(&root))),
        "flow" => Ok(Parsed::Skip),
        other => {
            // Unknown types that still carry an alert object are handled as
            // alerts; anything else is a parse failure.
            if root.get("alert").is_some() {
                parse_alert(&root).map(Parsed::Event)
            } else {
                Err(Error::Parse(format!("unrecognized event_type {other:?}")))
            }
        }
    }
}

fn get_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn get_i64(obj: &Value, key: &str, default: i64) -> i64 {
    obj.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn get_u64(obj: &Value, key: &str) -> u64 {
    obj.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn bounded_addr(value: Option<&str>) -> String {
    let addr = value.unwrap_or_default();
    if addr.len() > MAX_ADDR_LEN {
        addr.chars().take(MAX_ADDR_LEN).collect()
    } else {
        addr.to_owned()
    }
}

/// Common tuple and timestamp shared by every event branch.
fn fill_common(root: &Value, event: &mut SecurityEvent) {
    if let Some(ts) = get_str(root, "timestamp").and_then(Timestamp::parse_iso8601) {
        event.timestamp = ts;
    }
    event.src_addr = bounded_addr(get_str(root, "src_ip"));
    event.dst_addr = bounded_addr(get_str(root, "dest_ip"));
    event.src_port = get_i64(root, "src_port", 0) as u16;
    event.dst_port = get_i64(root, "dest_port", 0) as u16;
    event.protocol = Protocol::from_labels(get_str(root, "proto"), get_str(root, "app_proto"));
}

/// The automotive metadata objects override the protocol classification
/// when present.
fn fill_metadata(root: &Value, event: &mut SecurityEvent) {
    if let Some(someip) = root.get("someip") {
        event.metadata = Some(Metadata::SomeIp {
            service_id: get_i64(someip, "service_id", 0) as u16,
            method_id: get_i64(someip, "method_id", 0) as u16,
            client_id: get_i64(someip, "client_id", 0) as u16,
            session_id: get_i64(someip, "session_id", 0) as u16,
            message_type: get_i64(someip, "message_type", 0) as u8,
            return_code: get_i64(someip, "return_code", 0) as u8,
        });
        event.protocol = Protocol::SomeIp;
        return;
    }
    if let Some(doip) = root.get("doip") {
        event.metadata = Some(Metadata::DoIp {
            payload_type: get_i64(doip, "payload_type", 0) as u16,
            source_address: get_i64(doip, "source_address", 0) as u16,
            target_address: get_i64(doip, "target_address", 0) as u16,
        });
        event.protocol = Protocol::DoIp;
    }
}

fn parse_alert(root: &Value) -> Result<SecurityEvent, Error> {
    let alert = root
        .get("alert")
        .ok_or_else(|| Error::Parse("alert event missing alert object".to_owned()))?;

    let mut event = SecurityEvent::new(EventKind::Alert);
    fill_common(root, &mut event);

    event.rule_sid = get_i64(alert, "signature_id", 0) as u32;
    event.rule_gid = get_i64(alert, "gid", 1) as u32;
    event.severity = Severity::from_priority(get_i64(alert, "severity", 4));
    event.message = get_str(alert, "signature").unwrap_or_default().to_owned();

    fill_metadata(root, &mut event);
    Ok(event)
}

fn parse_anomaly(root: &Value) -> SecurityEvent {
    let mut event = SecurityEvent::new(EventKind::Anomaly);
    fill_common(root, &mut event);
    event.severity = Severity::Medium;
    event.message = root
        .get("anomaly")
        .and_then(|a| get_str(a, "type"))
        .unwrap_or("Network anomaly detected")
        .to_owned();
    fill_metadata(root, &mut event);
    event
}

fn parse_stats(root: &Value) -> Result<DetectorStats, Error> {
    let stats = root
        .get("stats")
        .ok_or_else(|| Error::Parse("stats event missing stats object".to_owned()))?;

    let mut out = DetectorStats::default();
    if let Some(capture) = stats.get("capture") {
        out.packets_captured = get_u64(capture, "kernel_packets");
        out.packets_dropped = get_u64(capture, "kernel_drops");
    }
    if let Some(decoder) = stats.get("decoder") {
        out.bytes_captured = get_u64(decoder, "bytes");
    }
    if let Some(detect) = stats.get("detect") {
        out.alerts_total = get_u64(detect, "alert");
    }
    if let Some(flow_mgr) = stats.get("flow_mgr") {
        out.flows_active = get_u64(flow_mgr, "flows_active") as u32;
    }
    if let Some(flow) = stats.get("flow") {
        out.memory_used_mb = (get_u64(flow, "memuse") / (1024 * 1024)) as u32;
    }
    out.uptime_seconds = get_u64(stats, "uptime");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALERT_LINE: &str = concat!(
        "{\"timestamp\":\"2024-01-15T10:30:45.123456+0000\",\"event_type\":\"alert\",",
        "\"src_ip\":\"10.0.0.1\",\"src_port\":1234,\"dest_ip\":\"10.0.0.2\",\"dest_port\":80,",
        "\"proto\":\"TCP\",\"alert\":{\"signature_id\":1000001,\"gid\":1,\"severity\":2,",
        "\"signature\":\"TEST ALERT\"}}"
    );

    #[test]
    fn alert_happy_path() {
        let Parsed::Event(event) = parse(ALERT_LINE).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.kind, EventKind::Alert);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.rule_sid, 1000001);
        assert_eq!(event.rule_gid, 1);
        assert_eq!(event.message, "TEST ALERT");
        assert_eq!(event.src_addr, "10.0.0.1");
        assert_eq!(event.src_port, 1234);
        assert_eq!(event.dst_addr, "10.0.0.2");
        assert_eq!(event.dst_port, 80);
        assert_eq!(event.protocol, Protocol::Tcp);
        assert_eq!(event.timestamp.sec, 1705314645);
        assert_eq!(event.timestamp.usec, 123456);
        assert!(event.metadata.is_none());
        assert!(!event.id.is_empty());
    }

    #[test]
    fn alert_without_alert_object_is_a_parse_error() {
        let line = "{\"event_type\":\"alert\",\"src_ip\":\"1.2.3.4\"}";
        assert!(matches!(parse(line), Err(Error::Parse(_))));
    }

    #[test]
    fn anomaly_gets_medium_severity_and_default_message() {
        let line = "{\"event_type\":\"anomaly\",\"src_ip\":\"1.2.3.4\"}";
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.kind, EventKind::Anomaly);
        assert_eq!(event.severity, Severity::Medium);
        assert_eq!(event.message, "Network anomaly detected");

        let line = "{\"event_type\":\"anomaly\",\"anomaly\":{\"type\":\"decode_error\"}}";
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.message, "decode_error");
    }

    #[test]
    fn flow_events_are_skipped() {
        let line = "{\"event_type\":\"flow\",\"src_ip\":\"1.2.3.4\"}";
        assert_eq!(parse(line).unwrap(), Parsed::Skip);
    }

    #[test]
    fn stats_frame_is_decoded() {
        let line = concat!(
            "{\"event_type\":\"stats\",\"stats\":{\"uptime\":120,",
            "\"capture\":{\"kernel_packets\":5000,\"kernel_drops\":12},",
            "\"decoder\":{\"bytes\":123456},\"detect\":{\"alert\":7},",
            "\"flow_mgr\":{\"flows_active\":42},\"flow\":{\"memuse\":10485760}}}"
        );
        let Parsed::Stats(stats) = parse(line).unwrap() else {
            panic!("expected stats");
        };
        assert_eq!(stats.uptime_seconds, 120);
        assert_eq!(stats.packets_captured, 5000);
        assert_eq!(stats.packets_dropped, 12);
        assert_eq!(stats.bytes_captured, 123456);
        assert_eq!(stats.alerts_total, 7);
        assert_eq!(stats.flows_active, 42);
        assert_eq!(stats.memory_used_mb, 10);
    }

    #[test]
    fn stats_without_stats_object_is_a_parse_error() {
        assert!(matches!(
            parse("{\"event_type\":\"stats\"}"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn unknown_type_with_alert_falls_back_to_alert() {
        let line = concat!(
            "{\"event_type\":\"ids_custom\",\"proto\":\"UDP\",",
            "\"alert\":{\"signature_id\":7,\"severity\":1,\"signature\":\"X\"}}"
        );
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.kind, EventKind::Alert);
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.rule_sid, 7);
    }

    #[test]
    fn unknown_type_without_alert_is_a_parse_error() {
        assert!(matches!(
            parse("{\"event_type\":\"telemetry\"}"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(parse("{nope"), Err(Error::Parse(_))));
        assert!(matches!(parse("{}"), Err(Error::Parse(_))));
    }

    #[test]
    fn unknown_severity_maps_to_low() {
        let line = concat!(
            "{\"event_type\":\"alert\",",
            "\"alert\":{\"signature_id\":1,\"severity\":9,\"signature\":\"X\"}}"
        );
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.severity, Severity::Low);
    }

    #[test]
    fn someip_metadata_forces_protocol() {
        let line = concat!(
            "{\"event_type\":\"alert\",\"proto\":\"UDP\",",
            "\"alert\":{\"signature_id\":2,\"severity\":2,\"signature\":\"SOMEIP\"},",
            "\"someip\":{\"service_id\":4660,\"method_id\":32769,\"client_id\":1,",
            "\"session_id\":2,\"message_type\":0,\"return_code\":0}}"
        );
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.protocol, Protocol::SomeIp);
        match event.metadata {
            Some(Metadata::SomeIp {
                service_id,
                method_id,
                ..
            }) => {
                assert_eq!(service_id, 4660);
                assert_eq!(method_id, 32769);
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[test]
    fn doip_metadata_forces_protocol() {
        let line = concat!(
            "{\"event_type\":\"alert\",\"proto\":\"TCP\",",
            "\"alert\":{\"signature_id\":3,\"severity\":3,\"signature\":\"DOIP\"},",
            "\"doip\":{\"payload_type\":32769,\"source_address\":3584,\"target_address\":1}}"
        );
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.protocol, Protocol::DoIp);
        assert!(matches!(event.metadata, Some(Metadata::DoIp { .. })));
    }

    #[test]
    fn overlong_addresses_are_truncated() {
        let addr = "a".repeat(80);
        let line = format!(
            "{{\"event_type\":\"alert\",\"src_ip\":\"{addr}\",\
             \"alert\":{{\"signature_id\":1,\"severity\":4,\"signature\":\"X\"}}}}"
        );
        let Parsed::Event(event) = parse(&line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.src_addr.len(), MAX_ADDR_LEN);
    }

    #[test]
    fn app_proto_wins_in_classification() {
        let line = concat!(
            "{\"event_type\":\"alert\",\"proto\":\"TCP\",\"app_proto\":\"dns\",",
            "\"alert\":{\"signature_id\":1,\"severity\":4,\"signature\":\"X\"}}"
        );
        let Parsed::Event(event) = parse(line).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event.protocol, Protocol::Dns);
    }
}
