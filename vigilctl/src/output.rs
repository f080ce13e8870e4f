// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Human-readable rendering of control-plane responses.

use serde_json::Value;

fn get_str<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("unknown")
}

fn get_u64(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(0)
}

pub fn print_status(data: &Value) {
    println!("Vigil Daemon Status");
    println!("-------------------");
    println!("Status:           {}", get_str(data, "status"));
    println!("Version:          {}", get_str(data, "version"));
    println!("Uptime:           {} seconds", get_u64(data, "uptime"));
    println!(
        "Detector:         {}",
        if data
            .get("detector_running")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            "running"
        } else {
            "stopped"
        }
    );
}

pub fn print_stats(data: &Value) {
    println!("Vigil Statistics");
    println!("----------------");
    let fields = [
        ("Uptime (detector)", "uptime_seconds"),
        ("Packets captured", "packets_captured"),
        ("Packets dropped", "packets_dropped"),
        ("Bytes captured", "bytes_captured"),
        ("Alerts total", "alerts_total"),
        ("Flows active", "flows_active"),
        ("Memory used (MB)", "memory_used_mb"),
    ];
    for (label, key) in fields {
        println!("{label:<20} {}", get_u64(data, key));
    }
    if let Some(queue) = data.get("queue") {
        println!("Queue enqueued:      {}", get_u64(queue, "enqueued"));
        println!("Queue dequeued:      {}", get_u64(queue, "dequeued"));
        println!("Queue dropped:       {}", get_u64(queue, "dropped"));
    }
    if let Some(pipeline) = data.get("pipeline") {
        println!("Events stored:       {}", get_u64(pipeline, "stored"));
    }
    if let Some(ingest) = data.get("ingest") {
        println!("Parse errors:        {}", get_u64(ingest, "parse_errors"));
    }
}

pub fn print_events(data: &Value) {
    let count = get_u64(data, "count");
    println!("Security Events ({count})");
    println!(
        "{:<20} {:<10} {:<21} {:<21} {}",
        "TIMESTAMP", "SEVERITY", "SRC", "DST", "MESSAGE"
    );
    println!("{:-<20} {:-<10} {:-<21} {:-<21} {:-<40}", "", "", "", "", "");

    let Some(events) = data.get("events").and_then(Value::as_array) else {
        return;
    };
    for event in events {
        let src = format!(
            "{}:{}",
            get_str(event, "src_ip"),
            get_u64(event, "src_port")
        );
        let dst = format!(
            "{}:{}",
            get_str(event, "dst_ip"),
            get_u64(event, "dst_port")
        );
        println!(
            "{:<20} {:<10} {:<21} {:<21} {}",
            get_u64(event, "timestamp"),
            get_str(event, "severity"),
            src,
            dst,
            get_str(event, "signature_msg"),
        );
    }
}

pub fn print_rules(data: &Value) {
    let count = get_u64(data, "count");
    println!("Rule files ({count})");
    let Some(rules) = data.get("rules").and_then(Value::as_array) else {
        return;
    };
    for rule in rules {
        println!("  {:<40} {:>10} bytes", get_str(rule, "name"), get_u64(rule, "size"));
    }
}
