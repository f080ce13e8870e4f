// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by the daemon and the CLI.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("generic failure")]
    Generic,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("ipc error: {0}")]
    Ipc(String),
    #[error("database error: {0}")]
    Db(String),
    #[error("detector subprocess error: {0}")]
    Detector(String),
}

impl Error {
    /// Stable textual form of the error class, independent of the message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Generic => "generic",
            Error::OutOfMemory => "out_of_memory",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::Timeout => "timeout",
            Error::Io(_) => "io",
            Error::Parse(_) => "parse",
            Error::Config(_) => "config",
            Error::Ipc(_) => "ipc",
            Error::Db(_) => "db",
            Error::Detector(_) => "detector",
        }
    }
}
