// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_domfs-fuse-host");

#[test]
fn help_runs_without_mounting() {
    let output = Command::new(BIN).arg("--help").output().expect("run domfs-fuse-host");
    assert!(output.status.success(), "--help should succeed");
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("--rpc-timeout-ms"));
    assert!(help.contains("--log-format"));
}

#[test]
fn unreadable_config_exits_with_config_status() {
    let tmp = tempfile::tempdir().unwrap();
    let output = Command::new(BIN)
        .arg("--config")
        .arg(tmp.path().join("missing.json"))
        .output()
        .expect("run domfs-fuse-host");
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn missing_mount_base_parent_exits_with_mount_status() {
    let tmp = tempfile::tempdir().unwrap();
    let output = Command::new(BIN)
        .arg("0")
        .arg(tmp.path().join("nope").join("mnt"))
        .output()
        .expect("run domfs-fuse-host");
    assert_eq!(output.status.code(), Some(3));
}
