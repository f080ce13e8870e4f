// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request and response schema for the control protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Commands recognized by the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Status,
    GetStats,
    SetConfig,
    Shutdown,
    ReloadRules,
    ListRules,
    ListEvents,
    ValidateRules,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Command::Status),
            "get_stats" => Some(Command::GetStats),
            "set_config" => Some(Command::SetConfig),
            "shutdown" => Some(Command::Shutdown),
            "reload_rules" => Some(Command::ReloadRules),
            "list_rules" => Some(Command::ListRules),
            "list_events" => Some(Command::ListEvents),
            "validate_rules" => Some(Command::ValidateRules),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::GetStats => "get_stats",
            Command::SetConfig => "set_config",
            Command::Shutdown => "shutdown",
            Command::ReloadRules => "reload_rules",
            Command::ListRules => "list_rules",
            Command::ListEvents => "list_events",
            Command::ValidateRules => "validate_rules",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried in every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    None = 0,
    InvalidCommand = 1,
    InvalidParams = 2,
    InvalidConfigKey = 3,
    RuleParse = 4,
    ResourceExhausted = 5,
    Internal = 6,
    ShutdownInProgress = 7,
}

impl IpcError {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpcError::None => "",
            IpcError::InvalidCommand => "Invalid command",
            IpcError::InvalidParams => "Invalid parameters",
            IpcError::InvalidConfigKey => "Invalid configuration key",
            IpcError::RuleParse => "Rule parse failure",
            IpcError::ResourceExhausted => "Resource exhausted",
            IpcError::Internal => "Internal error",
            IpcError::ShutdownInProgress => "Shutdown in progress",
        }
    }
}

/// A control request: `{"command": "<name>", "params": {...} | null}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Request {
            command: command.as_str().to_owned(),
            params: None,
        }
    }

    pub fn with_params(command: Command, params: Value) -> Self {
        Request {
            command: command.as_str().to_owned(),
            params: Some(params),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.command)
    }
}

/// A control response. `success` implies `error_code == 0`; on success,
/// `data` carries the payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub error_code: u32,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response {
            success: true,
            error_code: 0,
            error: String::new(),
            message: None,
            data: Some(data),
        }
    }

    pub fn ok_message(message: impl Into<String>) -> Self {
        Response {
            success: true,
            error_code: 0,
            error: String::new(),
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn err(error: IpcError, message: impl Into<String>) -> Self {
        Response {
            success: false,
            error_code: error.code(),
            error: error.as_str().to_owned(),
            message: Some(message.into()),
            data: None,
        }
    }
}
