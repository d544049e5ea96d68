//! Smoke tests -- verify the binary parses its arguments and rejects bad config.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("kadrion")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Ramp-up load generator"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("kadrion")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("kadrion"));
}

#[test]
fn test_config_argument_is_required() {
    Command::cargo_bin("kadrion")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicates::str::contains("<CONFIG>"));
}

#[test]
fn test_missing_config_file_is_fatal() {
    Command::cargo_bin("kadrion")
        .unwrap()
        .arg("/nonexistent/kadrion.yaml")
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to read config file"));
}

#[test]
fn test_unsupported_protocol_is_fatal() {
    let file = config_file(
        "addr: rtmp://127.0.0.1/live\ntype: rtmp\ninitial_count: 1\npump_count: 1\nduration: 1\n",
    );
    Command::cargo_bin("kadrion")
        .unwrap()
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("unknown connection type: rtmp"));
}

#[test]
fn test_missing_field_is_fatal() {
    let file = config_file("addr: ws://127.0.0.1:1/\ntype: ws\ninitial_count: 1\nduration: 1\n");
    Command::cargo_bin("kadrion")
        .unwrap()
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("pump_count is required"));
}

#[test]
fn test_unreachable_target_reports_all_failed() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let file = config_file(&format!(
        "addr: ws://127.0.0.1:{port}/\ntype: ws\ninitial_count: 1\npump_count: 1\nduration: 1\nthrottle_ms: 10\n"
    ));
    Command::cargo_bin("kadrion")
        .unwrap()
        .env("RUST_LOG", "info")
        .arg(file.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#"\"failed\":3"#)
                .or(predicate::str::contains(r#""failed":3"#)),
        );
}
