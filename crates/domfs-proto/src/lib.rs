// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DomFS protocol: commands exchanged with the browser agent
//!
//! This crate defines the `{cmd, args}` request envelope sent to the
//! browser-hosted agent, the frame encodings it understands, and the
//! per-command schemas its replies are decoded against.

pub mod messages;
pub mod validation;
pub mod wire;

// Re-export key types
pub use messages::{Command, RpcRequest, StatReply};
pub use validation::*;
pub use wire::{WireEncoding, WireError, BASE64_SUBPROTOCOL};
