// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request envelope and reply payload types

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Remote commands understood by the browser agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Getattr,
    Readdir,
    Read,
    Write,
    Create,
    Mkdir,
    Rmdir,
    Unlink,
    Rename,
    Symlink,
    Chmod,
    Chown,
    Utimens,
    Truncate,
    Getxattr,
    Setxattr,
    Listxattr,
    Removexattr,
}

impl Command {
    pub const ALL: [Command; 18] = [
        Command::Getattr,
        Command::Readdir,
        Command::Read,
        Command::Write,
        Command::Create,
        Command::Mkdir,
        Command::Rmdir,
        Command::Unlink,
        Command::Rename,
        Command::Symlink,
        Command::Chmod,
        Command::Chown,
        Command::Utimens,
        Command::Truncate,
        Command::Getxattr,
        Command::Setxattr,
        Command::Listxattr,
        Command::Removexattr,
    ];

    /// Name used for the `cmd` field on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Getattr => "getattr",
            Command::Readdir => "readdir",
            Command::Read => "read",
            Command::Write => "write",
            Command::Create => "create",
            Command::Mkdir => "mkdir",
            Command::Rmdir => "rmdir",
            Command::Unlink => "unlink",
            Command::Rename => "rename",
            Command::Symlink => "symlink",
            Command::Chmod => "chmod",
            Command::Chown => "chown",
            Command::Utimens => "utimens",
            Command::Truncate => "truncate",
            Command::Getxattr => "getxattr",
            Command::Setxattr => "setxattr",
            Command::Listxattr => "listxattr",
            Command::Removexattr => "removexattr",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| format!("unknown command: {}", s))
    }
}

/// A single `{cmd, args}` message.
///
/// There is no request identifier: the agent answers requests strictly in
/// order and the host never has more than one outstanding per connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub cmd: Command,
    pub args: Vec<Value>,
}

impl RpcRequest {
    pub fn new(cmd: Command, args: Vec<Value>) -> Self {
        Self { cmd, args }
    }

    pub fn getattr(path: &str) -> Self {
        Self::new(Command::Getattr, vec![json!(path), Value::Null])
    }

    pub fn readdir(path: &str) -> Self {
        Self::new(Command::Readdir, vec![json!(path), Value::Null])
    }

    pub fn read(path: &str, size: u32, offset: i64) -> Self {
        Self::new(Command::Read, vec![json!(path), json!(size), json!(offset)])
    }

    /// `data` travels as a JSON string; the agent stores text content.
    pub fn write(path: &str, data: &str, offset: i64, fh: u64) -> Self {
        Self::new(
            Command::Write,
            vec![json!(path), json!(data), json!(offset), json!(fh)],
        )
    }

    pub fn create(path: &str, mode: u32) -> Self {
        Self::new(Command::Create, vec![json!(path), json!(mode)])
    }

    pub fn mkdir(path: &str, mode: u32) -> Self {
        Self::new(Command::Mkdir, vec![json!(path), json!(mode)])
    }

    pub fn rmdir(path: &str) -> Self {
        Self::new(Command::Rmdir, vec![json!(path)])
    }

    pub fn unlink(path: &str) -> Self {
        Self::new(Command::Unlink, vec![json!(path)])
    }

    pub fn rename(old_path: &str, new_path: &str) -> Self {
        Self::new(Command::Rename, vec![json!(old_path), json!(new_path)])
    }

    /// `link_path` is where the link lives, `target` is what it points at.
    pub fn symlink(link_path: &str, target: &str) -> Self {
        Self::new(Command::Symlink, vec![json!(link_path), json!(target)])
    }

    pub fn chmod(path: &str, mode: u32) -> Self {
        Self::new(Command::Chmod, vec![json!(path), json!(mode)])
    }

    /// Ids left unchanged are sent as -1, as chown(2) expects.
    pub fn chown(path: &str, uid: Option<u32>, gid: Option<u32>) -> Self {
        let id = |v: Option<u32>| v.map(i64::from).unwrap_or(-1);
        Self::new(Command::Chown, vec![json!(path), json!(id(uid)), json!(id(gid))])
    }

    /// `None` asks the agent to stamp the current time.
    pub fn utimens(path: &str, times: Option<(f64, f64)>) -> Self {
        let times = match times {
            Some((atime, mtime)) => json!([atime, mtime]),
            None => Value::Null,
        };
        Self::new(Command::Utimens, vec![json!(path), times])
    }

    pub fn truncate(path: &str, length: u64) -> Self {
        Self::new(Command::Truncate, vec![json!(path), json!(length)])
    }

    pub fn getxattr(path: &str, name: &str) -> Self {
        Self::new(Command::Getxattr, vec![json!(path), json!(name)])
    }

    pub fn setxattr(path: &str, name: &str, value: &str) -> Self {
        Self::new(Command::Setxattr, vec![json!(path), json!(name), json!(value)])
    }

    pub fn listxattr(path: &str) -> Self {
        Self::new(Command::Listxattr, vec![json!(path), Value::Null])
    }

    pub fn removexattr(path: &str, name: &str) -> Self {
        Self::new(Command::Removexattr, vec![json!(path), json!(name)])
    }
}

/// Attribute mapping returned by `getattr`.
///
/// The agent omits fields it has no value for (`st_gid` is never sent and
/// `st_size` only exists for file-like nodes), so every field defaults.
/// Ids are signed because a previous `chown` may have stored -1.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatReply {
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_size: u64,
    pub st_uid: i64,
    pub st_gid: i64,
    pub st_atime: Option<f64>,
    pub st_mtime: Option<f64>,
    pub st_ctime: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_round_trip() {
        for cmd in Command::ALL {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
            assert_eq!(serde_json::to_value(cmd).unwrap(), json!(cmd.as_str()));
        }
        assert!("mknod".parse::<Command>().is_err());
    }

    #[test]
    fn request_serializes_as_cmd_and_args() {
        let request = RpcRequest::read("/html/body/p[1]", 4096, 10);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"cmd": "read", "args": ["/html/body/p[1]", 4096, 10]})
        );
    }

    #[test]
    fn chown_marks_unchanged_ids() {
        let request = RpcRequest::chown("/html", Some(1000), None);
        assert_eq!(request.args, vec![json!("/html"), json!(1000), json!(-1)]);
    }

    #[test]
    fn utimens_sends_null_for_now() {
        assert_eq!(RpcRequest::utimens("/html", None).args[1], Value::Null);
        assert_eq!(
            RpcRequest::utimens("/html", Some((1.0, 2.5))).args[1],
            json!([1.0, 2.5])
        );
    }

    #[test]
    fn stat_reply_tolerates_missing_fields() {
        let stat: StatReply = serde_json::from_value(json!({
            "st_mode": 16877,
            "st_nlink": 2,
            "st_uid": 0,
            "st_ctime": 1700000000,
        }))
        .unwrap();
        assert_eq!(stat.st_mode, 0o40755);
        assert_eq!(stat.st_size, 0);
        assert_eq!(stat.st_gid, 0);
        assert_eq!(stat.st_ctime, Some(1_700_000_000.0));
        assert_eq!(stat.st_mtime, None);
    }
}
