use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use pretty_assertions::assert_eq;

const REGISTRY: &str = r#"{
    "avatars": [{"id": "orders", "source": "orders"}],
    "columns": [
        {"field_id": "city", "avatar_id": "orders", "column": "city", "data_type": "STRING"},
        {"field_id": "sales", "avatar_id": "orders", "column": "sales", "data_type": "FLOAT"}
    ]
}"#;

const SPEC: &str = r#"{
    "select": [
        {"formula": {"kind": {"field": {"name": "city"}}}},
        {"formula": {"kind": {"func_call": {"name": "sum", "args": [{"kind": {"field": {"name": "sales"}}}]}}}}
    ],
    "group_by": [{"formula": {"kind": {"field": {"name": "city"}}}}]
}"#;

const BAD_SPEC: &str = r#"{
    "select": [{"formula": {"kind": {"field": {"name": "profit"}}}}]
}"#;

struct Inputs {
    _dir: tempfile::TempDir,
    registry: PathBuf,
    spec: PathBuf,
    bad_spec: PathBuf,
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write input");
    path
}

fn inputs() -> Inputs {
    let dir = tempfile::tempdir().expect("temp dir");
    Inputs {
        registry: write(dir.path(), "registry.json", REGISTRY),
        spec: write(dir.path(), "spec.json", SPEC),
        bad_spec: write(dir.path(), "bad_spec.json", BAD_SPEC),
        _dir: dir,
    }
}

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_formula_cli"))
}

fn run(command: &mut Command) -> Output {
    command.output().expect("run formula_cli")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn lists_single_dialects() {
    let output = run(cli().arg("dialects"));
    assert!(output.status.success());
    let names: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert!(names.contains(&"POSTGRESQL_9_4".to_string()), "{names:?}");
    assert!(!names.contains(&"POSTGRESQL".to_string()), "{names:?}");
}

#[test]
fn internal_functions_are_not_listed() {
    let output = run(cli().arg("functions").arg("--format").arg("json"));
    assert!(output.status.success());
    let functions: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let names: Vec<&str> = functions
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|function| function["name"].as_str())
        .collect();
    assert!(names.contains(&"sum"), "{names:?}");
    assert!(!names.contains(&"_dneq"), "{names:?}");
}

#[test]
fn translates_a_spec_to_sql() {
    let inputs = inputs();
    let output = run(cli()
        .arg("translate")
        .arg(&inputs.spec)
        .arg("--registry")
        .arg(&inputs.registry));
    assert!(
        output.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(
        stdout(&output),
        "SELECT orders.\"city\" AS \"res_1\", SUM(orders.\"sales\") AS \"res_2\" \
         FROM \"orders\" AS orders GROUP BY orders.\"city\"\n"
    );
}

#[test]
fn compile_json_lists_queries() {
    let inputs = inputs();
    let output = run(cli()
        .arg("compile")
        .arg(&inputs.spec)
        .arg("--registry")
        .arg(&inputs.registry)
        .arg("--format")
        .arg("json"));
    assert!(output.status.success());
    let compiled: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(compiled["queries"][0]["id"], "qq");
}

#[test]
fn formula_errors_exit_with_failure() {
    let inputs = inputs();
    let output = run(cli()
        .arg("compile")
        .arg(&inputs.bad_spec)
        .arg("--registry")
        .arg(&inputs.registry)
        .arg("--format")
        .arg("json"));
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["errors"][0]["code"], "FORMULA.UNKNOWN_FIELD");

    let output = run(cli()
        .arg("translate")
        .arg(&inputs.bad_spec)
        .arg("--registry")
        .arg(&inputs.registry));
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error[FORMULA.UNKNOWN_FIELD]"));
}

#[test]
fn unknown_dialect_is_rejected() {
    let output = run(cli().arg("functions").arg("--dialect").arg("nope"));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown dialect 'nope'"));
}

#[test]
fn text_output_does_not_panic_on_broken_pipe() {
    let mut child = cli()
        .arg("functions")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn formula_cli");

    // Closing the read end forces stdout writes to return EPIPE / BrokenPipe.
    drop(child.stdout.take());

    let output = child.wait_with_output().expect("wait for formula_cli");
    assert!(
        output.status.success(),
        "expected success even when stdout is closed\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
}
