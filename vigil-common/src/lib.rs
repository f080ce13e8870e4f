// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod error;
pub mod event;
pub mod stats;

pub use error::{Error, Result};
pub use event::{EventKind, Metadata, Protocol, SecurityEvent, Severity, Timestamp};
pub use stats::DetectorStats;

/// Daemon version reported by the `status` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
