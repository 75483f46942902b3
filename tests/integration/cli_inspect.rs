#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use scmo::{CimType, ClassBuilder, Instance, PropertyDecl, Streamer, Value};
use serde_json::Value as Json;
use tempfile::TempDir;

fn write_stream(dir: &TempDir, name: &str) -> PathBuf {
    let class = ClassBuilder::new("CIM_Volume")
        .property(PropertyDecl::new("DeviceID", CimType::String).key())
        .property(PropertyDecl::reference("Parent", "CIM_Volume"))
        .build()
        .expect("class");
    let parent = Instance::new(&class).expect("parent");
    parent
        .set_property("DeviceID", Value::String("disk0".into()))
        .expect("id");
    let child = Instance::new(&class).expect("child");
    child
        .set_property("DeviceID", Value::String("disk0p1".into()))
        .expect("id");
    child
        .set_property("Parent", Value::Reference(parent))
        .expect("parent ref");

    let bytes = Streamer::default()
        .serialize_to_vec(&[child])
        .expect("serialize");
    let path = dir.path().join(format!("{name}.scmo"));
    fs::write(&path, bytes).expect("write stream");
    path
}

fn inspect(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("scmo-inspect");
    cmd.env_remove("SCMO_INSPECT_CONFIG")
        .env_remove("RUST_LOG")
        .env("XDG_CONFIG_HOME", dir.path());
    cmd
}

#[test]
fn summary_json_reports_tables() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_stream(&dir, "volumes");
    let output = inspect(&dir)
        .args(["summary", "--json"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: Json = serde_json::from_slice(&output).expect("json output");
    assert_eq!(
        json["total_bytes"].as_u64(),
        Some(fs::metadata(&path).unwrap().len())
    );
    assert_eq!(json["classes"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["classes"][0]["name"], "CIM_Volume");
    assert_eq!(json["classes"][0]["properties"], 2);
    assert_eq!(json["instances"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["instances"][0]["root_ordinal"], Json::Null);
    assert_eq!(json["instances"][1]["root_ordinal"], 0);
    assert_eq!(json["instance_references"][0]["index"], 0);
}

#[test]
fn summary_text_lists_classes() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_stream(&dir, "volumes");
    let output = inspect(&dir)
        .arg("summary")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("CIM_Volume"), "{text}");
    assert!(text.contains("root #0"), "{text}");
    assert!(text.contains("References"), "{text}");
}

#[test]
fn verify_accepts_a_good_stream() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_stream(&dir, "volumes");
    let output = inspect(&dir)
        .arg("verify")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("stream is well formed"), "{text}");
}

#[test]
fn verify_rejects_a_truncated_stream() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_stream(&dir, "volumes");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let output = inspect(&dir)
        .arg("verify")
        .arg(&path)
        .assert()
        .code(2)
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("error: stream rejected"), "{text}");
}

#[test]
fn config_limits_apply_to_verify() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_stream(&dir, "volumes");
    let config = dir.path().join("inspect.toml");
    fs::write(&config, "[streamer]\nmax_chunk_len = 32\n").unwrap();

    inspect(&dir)
        .arg("--config")
        .arg(&config)
        .arg("verify")
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn missing_file_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let output = inspect(&dir)
        .arg("summary")
        .arg(dir.path().join("absent.scmo"))
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("failed to read"), "{text}");
}
