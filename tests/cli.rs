use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn fixpt() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fixpt"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn demo(name: &str) -> String {
    format!("{}/demos/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn source_file(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(source.as_bytes()).expect("write source");
    file
}

fn run(args: &[&str]) -> Output {
    fixpt().args(args).output().expect("failed to run fixpt")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

const FLIP: &str = "def x():\n    load_const 1\n    load_fast x\n    binary_subtract\n    store_fast x\n    load_const None\n    return_value\nend\n";

// --- run ---

#[test]
fn run_cosine_demo() {
    let out = run(&["run", &demo("cos.fxa"), "--init", "0.0"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "0.7390851332151607");
}

#[test]
fn run_newton_sqrt_demo() {
    let out = run(&["run", &demo("sqrt.fxa"), "--init", "1.0"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "1.414213562373095");
}

#[test]
fn run_yield_stops_with_value() {
    let out = run(&["run", &demo("triangle.fxa"), "--init", "0"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "55");
}

#[test]
fn run_last_routine_by_default() {
    let out = run(&["run", &demo("clamp.fxa"), "--init", "3"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "10");
}

#[test]
fn run_named_routine() {
    let file = source_file(&format!("{FLIP}\ndef y():\n    load_const None\n    return_value\nend\n"));
    let path = file.path().to_str().unwrap();
    let out = run(&["run", path, "--routine", "y", "--init", "(1, \"a\")"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "(1, \"a\")");

    let out = run(&["run", path, "--routine", "z", "--init", "0"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("no routine named 'z'"), "stderr: {}", stderr(&out));
    assert!(stderr(&out).contains("defined: x, y"), "stderr: {}", stderr(&out));
}

#[test]
fn run_without_init_is_usage_error() {
    let out = run(&["run", &demo("cos.fxa")]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error[FXP-U002]"), "stderr: {}", stderr(&out));
}

#[test]
fn run_divergence_reports_bound() {
    let file = source_file(FLIP);
    let out = run(&["run", file.path().to_str().unwrap(), "--init", "0", "--max-iterations", "10"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[FXP-D001]"), "stderr: {err}");
    assert!(err.contains("after 10 iterations"), "stderr: {err}");
}

#[test]
fn run_negative_bound_rejected() {
    let out = run(&["run", &demo("cos.fxa"), "--init", "0.0", "--max-iterations=-1"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error[FXP-U001]"), "stderr: {}", stderr(&out));
}

#[test]
fn run_bad_init_literal() {
    let out = run(&["run", &demo("cos.fxa"), "--init", "(1)"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error[FXP-P011]"), "stderr: {}", stderr(&out));
}

#[test]
fn run_naming_conflict() {
    let file = source_file("def g():\n    load_const 1\n    store_global g\n    load_const None\n    return_value\nend\n");
    let out = run(&["run", file.path().to_str().unwrap(), "--init", "0"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error[FXP-R001]"), "stderr: {}", stderr(&out));
}

#[test]
fn run_runtime_error() {
    let file = source_file("def x():\n    load_fast x\n    load_const 0\n    binary_true_divide\n    return_value\nend\n");
    let out = run(&["run", file.path().to_str().unwrap(), "--init", "1"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error[FXP-V001]"), "stderr: {}", stderr(&out));
}

#[test]
fn run_oversized_string_is_runtime_error() {
    let file = source_file(
        "def x():\n    load_const \"ab\"\n    load_const 9000000000000000000\n    binary_multiply\n    store_fast x\n    load_const None\n    return_value\nend\n",
    );
    let out = run(&["run", file.path().to_str().unwrap(), "--init", "0"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[FXP-V001]"), "stderr: {err}");
    assert!(err.contains("string result would exceed"), "stderr: {err}");
}

// --- diagnostics ---

#[test]
fn parse_error_points_into_source() {
    let file = source_file("def x(:\n    return_value\nend\n");
    let out = run(&["run", file.path().to_str().unwrap(), "--init", "0"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[FXP-P005]"), "stderr: {err}");
    assert!(err.contains("--> 1:7"), "stderr: {err}");
    assert!(err.contains("def x(:"), "stderr: {err}");
    assert!(!err.contains("\x1b["), "colour on a pipe: {err}");
}

#[test]
fn assembly_error_suggests_lowercase() {
    let file = source_file("def x():\n    LOAD_CONST None\n    return_value\nend\n");
    let out = run(&["dis", file.path().to_str().unwrap()]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[FXP-A001]"), "stderr: {err}");
    assert!(err.contains("'load_const'"), "stderr: {err}");
}

#[test]
fn json_diagnostics() {
    let file = source_file("def x():\n    jump_absolute nowhere\nend\n");
    let out = run(&["--json", "dis", file.path().to_str().unwrap()]);
    assert!(!out.status.success());
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("JSON diagnostic");
    assert_eq!(v["code"], "FXP-A008");
    assert_eq!(v["labels"][0]["line"], 2);
}

#[test]
fn missing_file() {
    let out = run(&["run", "/nonexistent/x.fxa"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("cannot read"), "stderr: {}", stderr(&out));
}

// --- dis / emit ---

#[test]
fn dis_original_and_rewritten() {
    let out = run(&["dis", &demo("cos.fxa")]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.starts_with("x (argcount=1"), "got: {text}");
    assert!(text.contains("(f)"), "got: {text}");
    assert!(text.contains("return_value"), "got: {text}");

    let out = run(&["dis", &demo("cos.fxa"), "--rewritten"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.starts_with("x (argcount=2"), "got: {text}");
    assert!(text.contains("build_tuple"), "got: {text}");
    assert!(text.contains("jump_forward"), "got: {text}");
}

#[test]
fn emit_code_object() {
    let out = run(&["emit", &demo("cos.fxa")]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("JSON code");
    assert_eq!(v["name"], "x");
    assert_eq!(v["varnames"], serde_json::json!(["f", "x"]));

    let out = run(&["emit", &demo("triangle.fxa"), "--rewritten"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("JSON code");
    assert_eq!(v["varnames"][0], "total");
    assert_eq!(v["argcount"], 3);
    assert_eq!(v["flags"], 0);
}

// --- explain ---

#[test]
fn explain_code() {
    let out = run(&["explain", "fxp-d001"]);
    assert!(out.status.success());
    assert!(stdout(&out).starts_with("## FXP-D001"));

    let out = run(&["explain", "--list"]);
    assert!(out.status.success());
    assert!(stdout(&out).lines().any(|l| l.starts_with("FXP-R001")));

    let out = run(&["explain", "FXP-Z999"]);
    assert!(!out.status.success());
}
