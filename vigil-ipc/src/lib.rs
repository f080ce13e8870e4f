// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The control-plane protocol: length-prefixed JSON frames over a local
//! stream socket. Each request frame elicits exactly one response frame.

pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, FrameBuffer, FrameError, MAX_FRAME_LEN};
pub use message::{Command, IpcError, Request, Response};
