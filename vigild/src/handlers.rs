// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control-plane command handlers. These run on the control-server thread
//! and must not block; the one potentially slow operation (rule
//! validation) is time-boxed.

use crate::dispatch::EventDispatcher;
use crate::ingest::IngestReader;
use crate::logging;
use crate::queue::EventQueue;
use crate::storage::Storage;
use crate::supervisor::Supervisor;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use vigil_common::Severity;
use vigil_ipc::{Command, IpcError, Request, Response};

const LIST_EVENTS_DEFAULT_LIMIT: usize = 100;
const LIST_EVENTS_MAX_LIMIT: usize = 1000;
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(30);

const CONFIG_KEYS: &[&str] = &[
    "log_level",
    "event_socket",
    "rules_dir",
    "max_events",
    "watchdog_interval",
    "stats_interval",
];

/// Settings the control plane can change at runtime. Keys that cannot be
/// hot-applied are recorded and reported back until the next restart.
pub struct RuntimeSettings {
    pub rules_dir: PathBuf,
    pub recorded: BTreeMap<String, String>,
}

/// Everything the handlers may query. Owned by the daemon, shared with the
/// control server thread.
pub struct ControlContext {
    pub running: Arc<AtomicBool>,
    pub started_at: Instant,
    pub supervisor: Arc<Supervisor>,
    pub reader: Arc<IngestReader>,
    pub queue: EventQueue,
    pub dispatcher: Arc<EventDispatcher>,
    pub storage: Arc<dyn Storage>,
    pub settings: Mutex<RuntimeSettings>,
}

pub fn handle_request(ctx: &ControlContext, request: &Request) -> Response {
    let Some(command) = request.command() else {
        debug!(command = %request.command, "unknown control command");
        return Response::err(IpcError::InvalidCommand, "Unknown command");
    };
    debug!(%command, "processing control command");

    match command {
        Command::Status => handle_status(ctx),
        Command::GetStats => handle_get_stats(ctx),
        Command::SetConfig => handle_set_config(ctx, request.params.as_ref()),
        Command::Shutdown => handle_shutdown(ctx),
        Command::ReloadRules => handle_reload_rules(ctx),
        Command::ListRules => handle_list_rules(ctx),
        Command::ListEvents => handle_list_events(ctx, request.params.as_ref()),
        Command::ValidateRules => handle_validate_rules(ctx),
    }
}

fn handle_status(ctx: &ControlContext) -> Response {
    let detector_running = ctx.supervisor.is_child_running();
    let status = if !ctx.running.load(Ordering::SeqCst) {
        "shutting_down"
    } else if detector_running {
        "running"
    } else {
        "degraded"
    };
    Response::ok(json!({
        "status": status,
        "version": vigil_common::VERSION,
        "uptime": ctx.started_at.elapsed().as_secs(),
        "detector_running": detector_running,
        "detector_state": ctx.supervisor.state().as_str(),
    }))
}

fn handle_get_stats(ctx: &ControlContext) -> Response {
    let detector = ctx.reader.detector_stats();
    let mut data = match serde_json::to_value(detector) {
        Ok(value) => value,
        Err(e) => return Response::err(IpcError::Internal, e.to_string()),
    };

    let queue_stats = ctx.queue.stats();
    let pipeline = ctx.dispatcher.counters();
    let ingest = ctx.reader.counters();
    if let Some(map) = data.as_object_mut() {
        map.insert(
            "daemon_uptime_seconds".to_owned(),
            json!(ctx.started_at.elapsed().as_secs()),
        );
        map.insert(
            "queue".to_owned(),
            json!({
                "enqueued": queue_stats.enqueued,
                "dequeued": queue_stats.dequeued,
                "dropped": queue_stats.dropped,
                "depth": ctx.queue.len(),
                "capacity": ctx.queue.capacity(),
            }),
        );
        map.insert(
            "pipeline".to_owned(),
            json!({
                "processed": pipeline.processed,
                "stored": pipeline.stored,
                "dropped": pipeline.dropped,
                "callbacks_invoked": pipeline.callbacks_invoked,
            }),
        );
        map.insert(
            "ingest".to_owned(),
            json!({
                "lines_read": ingest.lines_read,
                "events_parsed": ingest.events_parsed,
                "events_queued": ingest.events_queued,
                "parse_errors": ingest.parse_errors,
                "reconnects": ingest.reconnects,
            }),
        );
    }
    Response::ok(data)
}

#[derive(Deserialize)]
struct SetConfigParams {
    key: String,
    value: Value,
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn handle_set_config(ctx: &ControlContext, params: Option<&Value>) -> Response {
    let Some(params) = params else {
        return Response::err(IpcError::InvalidParams, "Missing parameters");
    };
    let params: SetConfigParams = match serde_json::from_value(params.clone()) {
        Ok(params) => params,
        Err(_) => return Response::err(IpcError::InvalidParams, "Invalid parameter format"),
    };

    // Arbitrary keys would widen the attack surface of a locally trusted
    // interface; only the whitelist is accepted.
    if !CONFIG_KEYS.contains(&params.key.as_str()) {
        return Response::err(IpcError::InvalidConfigKey, "Unknown configuration key");
    }

    let value = value_to_string(&params.value);
    info!(key = %params.key, %value, "configuration change requested");

    match params.key.as_str() {
        "log_level" => {
            if let Err(e) = logging::set_level(&value) {
                return Response::err(IpcError::InvalidParams, e.to_string());
            }
            Response::ok_message("Configuration updated")
        }
        "max_events" => match value.parse::<u64>() {
            Ok(max) => {
                ctx.storage.set_max_events(max);
                Response::ok_message("Configuration updated")
            }
            Err(_) => Response::err(IpcError::InvalidParams, "max_events must be an integer"),
        },
        "rules_dir" => {
            if let Ok(mut settings) = ctx.settings.lock() {
                settings.rules_dir = PathBuf::from(&value);
            }
            Response::ok_message("Configuration updated")
        }
        key => {
            if let Ok(mut settings) = ctx.settings.lock() {
                settings.recorded.insert(key.to_owned(), value);
            }
            Response::ok_message("Configuration recorded (takes effect on restart)")
        }
    }
}

fn handle_shutdown(ctx: &ControlContext) -> Response {
    info!("shutdown requested via control socket");
    ctx.running.store(false, Ordering::SeqCst);
    Response::ok_message("Shutdown initiated")
}

fn handle_reload_rules(ctx: &ControlContext) -> Response {
    match ctx.supervisor.reload_rules() {
        Ok(()) => Response::ok_message("Rules reloaded successfully"),
        Err(e) => Response::err(IpcError::Internal, e.to_string()),
    }
}

fn handle_list_rules(ctx: &ControlContext) -> Response {
    let rules_dir = match ctx.settings.lock() {
        Ok(settings) => settings.rules_dir.clone(),
        Err(_) => return Response::err(IpcError::Internal, "settings unavailable"),
    };

    let entries = match std::fs::read_dir(&rules_dir) {
        Ok(entries) => entries,
        Err(e) => {
            return Response::err(
                IpcError::Internal,
                format!("cannot read rules directory {}: {e}", rules_dir.display()),
            )
        }
    };

    let mut rules = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "rules") {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            rules.push(json!({"name": name, "size": size}));
        }
    }
    rules.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Response::ok(json!({"count": rules.len(), "rules": rules}))
}

#[derive(Default, Deserialize)]
struct ListEventsParams {
    limit: Option<usize>,
    severity: Option<String>,
    since: Option<i64>,
}

fn handle_list_events(ctx: &ControlContext, params: Option<&Value>) -> Response {
    let params: ListEventsParams = match params {
        None => ListEventsParams::default(),
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(params) => params,
            Err(_) => return Response::err(IpcError::InvalidParams, "Invalid parameter format"),
        },
    };

    let min_severity = match params.severity.as_deref() {
        None => None,
        Some(name) => match Severity::parse(name) {
            Some(severity) => Some(severity),
            None => {
                return Response::err(
                    IpcError::InvalidParams,
                    format!("unknown severity {name:?}"),
                )
            }
        },
    };
    let limit = params
        .limit
        .unwrap_or(LIST_EVENTS_DEFAULT_LIMIT)
        .min(LIST_EVENTS_MAX_LIMIT);

    let events = match ctx.storage.query_recent(limit, min_severity, params.since) {
        Ok(events) => events,
        Err(e) => return Response::err(IpcError::Internal, e.to_string()),
    };

    let events: Vec<Value> = events
        .iter()
        .map(|event| {
            json!({
                "id": event.id,
                "timestamp": event.timestamp.sec,
                "timestamp_usec": event.timestamp.usec,
                "event_type": event.kind.as_str(),
                "severity": event.severity.as_str(),
                "protocol": event.protocol.as_str(),
                "src_ip": event.src_addr,
                "src_port": event.src_port,
                "dst_ip": event.dst_addr,
                "dst_port": event.dst_port,
                "signature_id": event.rule_sid,
                "signature_gid": event.rule_gid,
                "signature_msg": event.message,
            })
        })
        .collect();

    Response::ok(json!({"count": events.len(), "events": events}))
}

fn handle_validate_rules(ctx: &ControlContext) -> Response {
    match ctx.supervisor.validate_rules(VALIDATE_TIMEOUT) {
        Ok(status) if status.success() => Response::ok_message("Rules validated successfully"),
        Ok(status) => Response::err(
            IpcError::RuleParse,
            format!("Rule validation failed ({status})"),
        ),
        Err(e) => Response::err(IpcError::Internal, e.to_string()),
    }
}
