// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing setup with a runtime-reloadable level filter, used by the
//! `set_config log_level` command and SIGHUP config reload.

use anyhow::Context;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn filter_for(level: &str) -> anyhow::Result<EnvFilter> {
    // "fatal" is part of the config surface but tracing tops out at error.
    let level = if level.eq_ignore_ascii_case("fatal") {
        "error"
    } else {
        level
    };
    // Parse as a level first: EnvFilter would accept any bare identifier
    // as a target directive.
    let level: tracing::Level = level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level {level:?}"))?;
    Ok(EnvFilter::new(level.to_string()))
}

/// Installs the global subscriber. Safe to call more than once; only the
/// first call wins (matters for tests).
pub fn init(level: &str) -> anyhow::Result<()> {
    let (filter, handle) = reload::Layer::new(filter_for(level)?);
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));
    if registry.try_init().is_ok() {
        let _ = RELOAD_HANDLE.set(handle);
    }
    Ok(())
}

/// Swaps the active level filter.
pub fn set_level(level: &str) -> anyhow::Result<()> {
    let handle = RELOAD_HANDLE.get().context("logging not initialized")?;
    handle
        .reload(filter_for(level)?)
        .context("failed to reload log filter")?;
    Ok(())
}
