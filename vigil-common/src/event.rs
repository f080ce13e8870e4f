// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Security event records produced by the detector event stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Addresses are textual, IPv6 plus scope fits in 45 bytes.
pub const MAX_ADDR_LEN: usize = 45;

/// Alert severity. The numeric grade is inverted: critical is the most
/// severe and compares lowest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Info = 5,
}

impl Severity {
    /// Numeric grade, critical=1 through info=5.
    pub fn grade(self) -> u8 {
        self as u8
    }

    /// Maps the detector's numeric alert priority (1..4). Anything else is
    /// treated as low.
    pub fn from_priority(priority: i64) -> Self {
        match priority {
            1 => Severity::Critical,
            2 => Severity::High,
            3 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }

    pub fn from_grade(grade: u8) -> Option<Self> {
        match grade {
            1 => Some(Severity::Critical),
            2 => Some(Severity::High),
            3 => Some(Severity::Medium),
            4 => Some(Severity::Low),
            5 => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which parser branch produced the event and which subscribers match it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alert = 1,
    Anomaly = 2,
    Flow = 3,
    Stats = 4,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::Anomaly => "anomaly",
            EventKind::Flow => "flow",
            EventKind::Stats => "stats",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EventKind::Alert),
            2 => Some(EventKind::Anomaly),
            3 => Some(EventKind::Flow),
            4 => Some(EventKind::Stats),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport or application protocol tag. The application protocol reported
/// by the detector wins over the transport protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Unknown = 0,
    Tcp = 1,
    Udp = 2,
    Icmp = 3,
    Igmp = 4,
    SomeIp = 10,
    DoIp = 11,
    Gbt32960 = 12,
    Http = 20,
    Tls = 21,
    Dns = 22,
    Mqtt = 23,
    Ftp = 24,
    Telnet = 25,
}

impl Protocol {
    /// Classifies the detector's `proto`/`app_proto` strings.
    pub fn from_labels(proto: Option<&str>, app_proto: Option<&str>) -> Self {
        if let Some(app) = app_proto {
            match app.to_ascii_lowercase().as_str() {
                "http" => return Protocol::Http,
                "tls" => return Protocol::Tls,
                "dns" => return Protocol::Dns,
                "mqtt" => return Protocol::Mqtt,
                "ftp" => return Protocol::Ftp,
                "telnet" => return Protocol::Telnet,
                "someip" => return Protocol::SomeIp,
                "doip" => return Protocol::DoIp,
                "gbt32960" => return Protocol::Gbt32960,
                _ => {}
            }
        }
        if let Some(proto) = proto {
            match proto.to_ascii_lowercase().as_str() {
                "tcp" => return Protocol::Tcp,
                "udp" => return Protocol::Udp,
                "icmp" => return Protocol::Icmp,
                "igmp" => return Protocol::Igmp,
                _ => {}
            }
        }
        Protocol::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Unknown => "unknown",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Igmp => "igmp",
            Protocol::SomeIp => "someip",
            Protocol::DoIp => "doip",
            Protocol::Gbt32960 => "gbt32960",
            Protocol::Http => "http",
            Protocol::Tls => "tls",
            Protocol::Dns => "dns",
            Protocol::Mqtt => "mqtt",
            Protocol::Ftp => "ftp",
            Protocol::Telnet => "telnet",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Protocol::Unknown),
            1 => Some(Protocol::Tcp),
            2 => Some(Protocol::Udp),
            3 => Some(Protocol::Icmp),
            4 => Some(Protocol::Igmp),
            10 => Some(Protocol::SomeIp),
            11 => Some(Protocol::DoIp),
            12 => Some(Protocol::Gbt32960),
            20 => Some(Protocol::Http),
            21 => Some(Protocol::Tls),
            22 => Some(Protocol::Dns),
            23 => Some(Protocol::Mqtt),
            24 => Some(Protocol::Ftp),
            25 => Some(Protocol::Telnet),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event time with microsecond precision, as reported by the detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: elapsed.as_secs() as i64,
            usec: elapsed.subsec_micros(),
        }
    }

    /// Parses the detector's textual timestamp,
    /// e.g. `2024-01-15T10:30:45.123456+0000`.
    pub fn parse_iso8601(s: &str) -> Option<Self> {
        let parsed = chrono::DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z").ok()?;
        Some(Timestamp {
            sec: parsed.timestamp(),
            usec: parsed.timestamp_subsec_micros(),
        })
    }
}

/// Per-protocol metadata attached to an event. The variant must agree with
/// the event's protocol tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Metadata {
    SomeIp {
        service_id: u16,
        method_id: u16,
        client_id: u16,
        session_id: u16,
        message_type: u8,
        return_code: u8,
    },
    DoIp {
        payload_type: u16,
        source_address: u16,
        target_address: u16,
    },
    Gbt32960 {
        command: u8,
        vin: String,
        encryption: u8,
    },
    Http {
        method: String,
        uri: String,
        host: String,
        status_code: u16,
    },
    Dns {
        query_type: String,
        query_name: String,
    },
    Flood {
        attack_type: String,
        packet_count: u64,
        pps_rate: u32,
    },
}

/// One detector finding. Created by the parser, moved by value through the
/// queue into storage; never aliased across threads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: Timestamp,
    pub kind: EventKind,
    pub severity: Severity,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub rule_sid: u32,
    pub rule_gid: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl SecurityEvent {
    /// A blank alert record with a fresh id and the current time. The parser
    /// fills in the rest.
    pub fn new(kind: EventKind) -> Self {
        SecurityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Timestamp::now(),
            kind,
            severity: Severity::Info,
            src_addr: String::new(),
            src_port: 0,
            dst_addr: String::new(),
            dst_port: 0,
            protocol: Protocol::Unknown,
            rule_sid: 0,
            rule_gid: 0,
            message: String::new(),
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_grades_are_inverted() {
        assert!(Severity::Critical.grade() < Severity::Info.grade());
        assert_eq!(Severity::Critical.grade(), 1);
        assert_eq!(Severity::Info.grade(), 5);
    }

    #[test]
    fn severity_from_priority_defaults_to_low() {
        assert_eq!(Severity::from_priority(1), Severity::Critical);
        assert_eq!(Severity::from_priority(2), Severity::High);
        assert_eq!(Severity::from_priority(3), Severity::Medium);
        assert_eq!(Severity::from_priority(4), Severity::Low);
        assert_eq!(Severity::from_priority(0), Severity::Low);
        assert_eq!(Severity::from_priority(99), Severity::Low);
    }

    #[test]
    fn app_proto_wins_over_transport() {
        assert_eq!(
            Protocol::from_labels(Some("TCP"), Some("http")),
            Protocol::Http
        );
        assert_eq!(Protocol::from_labels(Some("UDP"), None), Protocol::Udp);
        assert_eq!(
            Protocol::from_labels(Some("TCP"), Some("bogus")),
            Protocol::Tcp
        );
        assert_eq!(Protocol::from_labels(Some("sctp"), None), Protocol::Unknown);
        assert_eq!(Protocol::from_labels(None, None), Protocol::Unknown);
    }

    #[test]
    fn timestamp_parses_detector_format() {
        let ts = Timestamp::parse_iso8601("2024-01-15T10:30:45.123456+0000").unwrap();
        assert_eq!(ts.sec, 1705314645);
        assert_eq!(ts.usec, 123456);

        let ts = Timestamp::parse_iso8601("2024-01-15T10:30:45+0000").unwrap();
        assert_eq!(ts.usec, 0);

        assert!(Timestamp::parse_iso8601("not a timestamp").is_none());
    }

    #[test]
    fn event_serde_round_trip() {
        let mut event = SecurityEvent::new(EventKind::Alert);
        event.severity = Severity::High;
        event.src_addr = "10.0.0.1".into();
        event.src_port = 1234;
        event.dst_addr = "10.0.0.2".into();
        event.dst_port = 80;
        event.protocol = Protocol::SomeIp;
        event.rule_sid = 1000001;
        event.rule_gid = 1;
        event.message = "TEST ALERT".into();
        event.metadata = Some(Metadata::SomeIp {
            service_id: 0x1234,
            method_id: 0x8001,
            client_id: 1,
            session_id: 2,
            message_type: 0,
            return_code: 0,
        });

        let json = serde_json::to_string(&event).unwrap();
        let back: SecurityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn every_enum_value_round_trips() {
        let severities = [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Info,
        ];
        let kinds = [
            EventKind::Alert,
            EventKind::Anomaly,
            EventKind::Flow,
            EventKind::Stats,
        ];
        let protocols = [
            Protocol::Unknown,
            Protocol::Tcp,
            Protocol::Udp,
            Protocol::Icmp,
            Protocol::Igmp,
            Protocol::SomeIp,
            Protocol::DoIp,
            Protocol::Gbt32960,
            Protocol::Http,
            Protocol::Tls,
            Protocol::Dns,
            Protocol::Mqtt,
            Protocol::Ftp,
            Protocol::Telnet,
        ];

        for kind in kinds {
            for severity in severities {
                for protocol in protocols {
                    let mut event = SecurityEvent::new(kind);
                    event.severity = severity;
                    event.protocol = protocol;
                    event.message = format!("{kind}/{severity}/{protocol}");
                    let json = serde_json::to_string(&event).unwrap();
                    let back: SecurityEvent = serde_json::from_str(&json).unwrap();
                    assert_eq!(event, back);
                }
            }
        }

        // The textual forms survive the grade/tag mappings too.
        for severity in severities {
            assert_eq!(Severity::parse(severity.as_str()), Some(severity));
            assert_eq!(Severity::from_grade(severity.grade()), Some(severity));
        }
        for kind in kinds {
            assert_eq!(EventKind::from_u8(kind as u8), Some(kind));
        }
        for protocol in protocols {
            assert_eq!(Protocol::from_u8(protocol as u8), Some(protocol));
        }
    }
}
