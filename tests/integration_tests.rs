//! CLI smoke tests: help and version banners, config commands, and the
//! select → selection → query → export flow against a scratch directory.

mod common;

use std::fs;

use smartlab_twin::ingest::reading::Reading;
use smartlab_twin::store::sqlite::ReadingStore;

const LIVINGROOM_CO2: &str = "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>";

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: sltwin [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(
        result.stdout.contains(env!("CARGO_PKG_VERSION")),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommand_help_flags_work() {
    let subcommands = [
        "run",
        "select",
        "selection",
        "watch",
        "query",
        "export",
        "groups",
        "actuate",
        "peek",
        "config",
        "completions",
    ];
    for sub in subcommands {
        let result = common::run_cli_case(&format!("help_{sub}"), &[sub, "--help"]);
        assert!(
            result.status.success(),
            "{sub} --help failed; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn config_validate_reports_hash() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path());
    let config = config.to_string_lossy();

    let result = common::run_cli_case(
        "config_validate_reports_hash",
        &["--config", &config, "config", "validate"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let json = common::last_json(&result);
    assert_eq!(json["valid"], true);
    assert_eq!(json["hash"].as_str().map(str::len), Some(16));
}

#[test]
fn missing_explicit_config_is_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let result = common::run_cli_case(
        "missing_explicit_config_is_user_error",
        &["--config", &missing.to_string_lossy(), "groups"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("SLT-1002"));
}

#[test]
fn groups_lists_protocol_groups_without_all() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path());
    let config = config.to_string_lossy();

    let result = common::run_cli_case("groups_all", &["--config", &config, "groups", "KNX"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let options = common::last_json(&result)["options"].clone();
    assert!(!options.as_array().unwrap().iter().any(|o| o == "all"));

    let result = common::run_cli_case("groups_co2", &["--config", &config, "groups", "CO2-ppm"]);
    let options = common::last_json(&result)["options"].clone();
    assert_eq!(options[0], "all");
    assert_eq!(options.as_array().unwrap().len(), 4);
}

#[test]
fn unknown_group_is_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path());
    let result = common::run_cli_case(
        "unknown_group_is_user_error",
        &["--config", &config.to_string_lossy(), "select", "--group", "Attic"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("SLT-1101"));
}

#[test]
fn select_then_selection_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path());
    let config = config.to_string_lossy();

    let result = common::run_cli_case(
        "select_group_all",
        &["--config", &config, "select", "--group", "CO2-ppm", "all"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let published = common::last_json(&result)["topics"].clone();
    assert_eq!(published.as_array().unwrap().len(), 3);

    let raw = fs::read_to_string(dir.path().join("shared_topic.json")).unwrap();
    assert!(raw.starts_with(r#"{"visual_topics":["#));

    let result = common::run_cli_case("selection_read", &["--config", &config, "selection"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let json = common::last_json(&result);
    assert_eq!(json["exists"], true);
    assert_eq!(json["topics"], published);

    let activity = fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
    assert!(activity.contains("\"selection_published\""));
}

#[test]
fn query_and_export_read_the_stores() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = common::write_config(dir.path());
    let config = common::config_in(dir.path());
    let history = ReadingStore::open_with_schema(&config.paths.history_db).unwrap();
    for value in [410.0, 455.5] {
        history.write(&Reading::now(LIVINGROOM_CO2, value)).unwrap();
    }
    drop(history);
    let config_arg = config_path.to_string_lossy();

    let result = common::run_cli_case(
        "query_history",
        &["--config", &config_arg, "query", LIVINGROOM_CO2, "--history"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let json = common::last_json(&result);
    assert_eq!(json["rows"].as_array().unwrap().len(), 2);
    assert_eq!(json["status"], "occupied");

    let destination = dir.path().join("export").join("history.csv");
    let result = common::run_cli_case(
        "export_history",
        &["--config", &config_arg, "export", &destination.to_string_lossy()],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(common::last_json(&result)["rows"], 2);
    let csv = fs::read_to_string(&destination).unwrap();
    assert!(csv.starts_with("sensor_id,timestamp,value\n"));
    assert_eq!(csv.lines().count(), 3);
}

#[test]
fn query_without_store_is_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path());
    let result = common::run_cli_case(
        "query_without_store",
        &["--config", &config.to_string_lossy(), "query", LIVINGROOM_CO2],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
}
