// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema validation for agent replies
//!
//! Every command has an expected reply shape. Replies are decoded into a typed
//! value against that shape instead of being trusted as-is.

use crate::messages::{Command, StatReply};
use serde_json::Value;
use thiserror::Error;

/// Validation error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{cmd} reply must be {expected}, got {actual}")]
    Shape {
        cmd: Command,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{cmd} reply is malformed: {reason}")]
    Field { cmd: Command, reason: String },
}

/// Reply shape expected for each command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyShape {
    /// Attribute mapping (`getattr`)
    Attributes,
    /// Sequence of names (`readdir`, `listxattr`)
    Names,
    /// Text payload (`read`, `getxattr`)
    Text,
    /// Byte count (`write`)
    Count,
    /// Anything; the value is not inspected
    Acknowledgement,
}

impl Command {
    pub fn reply_shape(&self) -> ReplyShape {
        match self {
            Command::Getattr => ReplyShape::Attributes,
            Command::Readdir | Command::Listxattr => ReplyShape::Names,
            Command::Read | Command::Getxattr => ReplyShape::Text,
            Command::Write => ReplyShape::Count,
            Command::Create
            | Command::Mkdir
            | Command::Rmdir
            | Command::Unlink
            | Command::Rename
            | Command::Symlink
            | Command::Chmod
            | Command::Chown
            | Command::Utimens
            | Command::Truncate
            | Command::Setxattr
            | Command::Removexattr => ReplyShape::Acknowledgement,
        }
    }
}

/// Acknowledgement reply; the agent's answer is kept only for logging.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack(pub Value);

/// A typed reply decodable from a JSON value.
pub trait ReplySchema: Sized {
    const SHAPE: ReplyShape;

    fn from_value(cmd: Command, value: Value) -> Result<Self, ValidationError>;
}

/// Decode `value` as the reply to `cmd`, checking that the requested type
/// matches the command's schema.
pub fn decode_reply<T: ReplySchema>(cmd: Command, value: Value) -> Result<T, ValidationError> {
    debug_assert_eq!(cmd.reply_shape(), T::SHAPE, "{} decoded with wrong schema", cmd);
    T::from_value(cmd, value)
}

/// Short JSON type name for error messages
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "mapping",
    }
}

fn shape_error(cmd: Command, expected: &'static str, value: &Value) -> ValidationError {
    ValidationError::Shape {
        cmd,
        expected,
        actual: value_kind(value),
    }
}

impl ReplySchema for StatReply {
    const SHAPE: ReplyShape = ReplyShape::Attributes;

    fn from_value(cmd: Command, value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(shape_error(cmd, "a mapping", &value));
        }
        serde_json::from_value(value).map_err(|e| ValidationError::Field {
            cmd,
            reason: e.to_string(),
        })
    }
}

impl ReplySchema for Vec<String> {
    const SHAPE: ReplyShape = ReplyShape::Names;

    fn from_value(cmd: Command, value: Value) -> Result<Self, ValidationError> {
        let Value::Array(items) = value else {
            return Err(shape_error(cmd, "a sequence", &value));
        };
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::String(name) => Ok(name),
                other => Err(ValidationError::Field {
                    cmd,
                    reason: format!("entry {} is {}, expected string", i, value_kind(&other)),
                }),
            })
            .collect()
    }
}

impl ReplySchema for String {
    const SHAPE: ReplyShape = ReplyShape::Text;

    fn from_value(cmd: Command, value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::String(text) => Ok(text),
            other => Err(shape_error(cmd, "a string", &other)),
        }
    }
}

impl ReplySchema for u32 {
    const SHAPE: ReplyShape = ReplyShape::Count;

    fn from_value(cmd: Command, value: Value) -> Result<Self, ValidationError> {
        let Some(count) = value.as_u64() else {
            return Err(shape_error(cmd, "a non-negative integer", &value));
        };
        u32::try_from(count).map_err(|_| ValidationError::Field {
            cmd,
            reason: format!("count {} out of range", count),
        })
    }
}

impl ReplySchema for Ack {
    const SHAPE: ReplyShape = ReplyShape::Acknowledgement;

    fn from_value(_cmd: Command, value: Value) -> Result<Self, ValidationError> {
        Ok(Ack(value))
    }
}
