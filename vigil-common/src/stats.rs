// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Snapshot of detector counters, decoded from the detector's periodic
/// stats frames. The latest snapshot overwrites the previous one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorStats {
    pub uptime_seconds: u64,
    pub packets_captured: u64,
    pub bytes_captured: u64,
    pub packets_dropped: u64,
    pub capture_errors: u64,
    pub alerts_total: u64,
    pub rules_loaded: u32,
    pub rules_failed: u32,
    pub flows_active: u32,
    pub flows_total: u64,
    pub memory_used_mb: u32,
    pub memory_limit_mb: u32,
    pub avg_latency_us: u32,
    pub p99_latency_us: u32,
    pub pps: u32,
}
