// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use domfs_proto::*;
use serde_json::{json, Value};

#[test]
fn test_getattr_mapping_decodes_fields_unchanged() {
    let stat: StatReply = decode_reply(
        Command::Getattr,
        json!({
            "st_mode": 0o100755,
            "st_nlink": 1,
            "st_size": 42,
            "st_uid": 1000,
            "st_atime": 1700000000,
            "st_mtime": 1700000001,
            "st_ctime": 1700000002,
        }),
    )
    .unwrap();

    assert_eq!(stat.st_mode, 0o100755);
    assert_eq!(stat.st_nlink, 1);
    assert_eq!(stat.st_size, 42);
    assert_eq!(stat.st_uid, 1000);
    assert_eq!(stat.st_atime, Some(1_700_000_000.0));
    assert_eq!(stat.st_mtime, Some(1_700_000_001.0));
    assert_eq!(stat.st_ctime, Some(1_700_000_002.0));
}

#[test]
fn test_getattr_non_mapping_is_shape_error() {
    for value in [Value::Null, json!(["a"]), json!(3), json!("x"), json!(true)] {
        let err = decode_reply::<StatReply>(Command::Getattr, value).unwrap_err();
        assert!(
            matches!(err, ValidationError::Shape { cmd: Command::Getattr, .. }),
            "unexpected error: {err:?}"
        );
    }
}

#[test]
fn test_getattr_mistyped_field_is_field_error() {
    let err = decode_reply::<StatReply>(Command::Getattr, json!({"st_mode": "dir"})).unwrap_err();
    assert!(matches!(err, ValidationError::Field { .. }));
}

#[test]
fn test_readdir_requires_string_entries() {
    let names: Vec<String> =
        decode_reply(Command::Readdir, json!([".", "..", "p[@id=\"intro\"]"])).unwrap();
    assert_eq!(names, vec![".", "..", "p[@id=\"intro\"]"]);

    let err = decode_reply::<Vec<String>>(Command::Readdir, json!([".", 7])).unwrap_err();
    assert_eq!(
        err,
        ValidationError::Field {
            cmd: Command::Readdir,
            reason: "entry 1 is number, expected string".to_string(),
        }
    );

    let err = decode_reply::<Vec<String>>(Command::Readdir, Value::Null).unwrap_err();
    assert_eq!(
        err,
        ValidationError::Shape {
            cmd: Command::Readdir,
            expected: "a sequence",
            actual: "null",
        }
    );
}

#[test]
fn test_write_count_must_be_non_negative_integer() {
    assert_eq!(decode_reply::<u32>(Command::Write, json!(5)).unwrap(), 5);
    assert!(decode_reply::<u32>(Command::Write, json!(-1)).is_err());
    assert!(decode_reply::<u32>(Command::Write, json!("5")).is_err());
}

#[test]
fn test_acknowledgements_accept_anything() {
    for cmd in Command::ALL {
        if cmd.reply_shape() != ReplyShape::Acknowledgement {
            continue;
        }
        for value in [json!(true), Value::Null, json!(0), json!({"odd": 1})] {
            let Ack(inner) = decode_reply(cmd, value.clone()).unwrap();
            assert_eq!(inner, value);
        }
    }
}

#[test]
fn test_every_command_has_a_shape() {
    assert_eq!(Command::Getattr.reply_shape(), ReplyShape::Attributes);
    assert_eq!(Command::Read.reply_shape(), ReplyShape::Text);
    assert_eq!(Command::Getxattr.reply_shape(), ReplyShape::Text);
    assert_eq!(Command::Listxattr.reply_shape(), ReplyShape::Names);
    assert_eq!(Command::Write.reply_shape(), ReplyShape::Count);
    assert_eq!(Command::Create.reply_shape(), ReplyShape::Acknowledgement);
}
