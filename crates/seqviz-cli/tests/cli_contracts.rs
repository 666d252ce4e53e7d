#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn seqviz_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_seqviz") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/seqviz");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "seqviz-cli", "--bin", "seqviz"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build seqviz binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("seqviz-cli-test-{}-{}.sqlite", name, Ulid::new()))
}

fn seqviz_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(seqviz_binary_path());
    command
        .arg("--db")
        .arg(db_path)
        .args(["--step-delay-ms", "0", "--no-telemetry", "--quiet", "--json"]);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run seqviz command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn products_lists_seed_catalog() {
    let db = temp_db_path("products");
    let output = seqviz_output(&db, &["products"]);
    assert_success(&output);
    let value = stdout_json(&output);
    assert_eq!(value.as_array().map(Vec::len), Some(55));

    let output = seqviz_output(&db, &["products", "--category", "laptops"]);
    assert_success(&output);
    let value = stdout_json(&output);
    let laptops = value.as_array().cloned().unwrap_or_default();
    assert_eq!(laptops.len(), 10);
    assert!(laptops.iter().all(|product| product["stock"] == 0));
}

#[test]
fn search_reports_completed_run_and_archive() {
    let db = temp_db_path("search");
    let output = seqviz_output(&db, &["search", "neural"]);
    assert_success(&output);
    let value = stdout_json(&output);

    assert_eq!(value["result"]["kind"], "search");
    assert_eq!(value["result"]["outcome"], "completed");
    assert_eq!(value["result"]["archived"], true);
    assert_eq!(value["result"]["value"].as_array().map(Vec::len), Some(15));

    let history = value["snapshot"]["history"].as_array().cloned().unwrap_or_default();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["steps"].as_array().map(Vec::len), Some(7));
    assert_eq!(value["snapshot"]["running"], false);
}

#[test]
fn purchase_out_of_stock_is_a_failed_run() {
    let db = temp_db_path("purchase");
    let output = seqviz_output(&db, &["purchase", "lap-1"]);
    assert_success(&output);
    let value = stdout_json(&output);
    assert_eq!(value["result"]["outcome"], "failed");
    assert_eq!(value["result"]["error"], "Out of stock");
    assert_eq!(value["snapshot"]["history"][0]["steps"][1]["status"], "error");
}

#[test]
fn purchase_unknown_product_exits_non_zero() {
    let db = temp_db_path("unknown");
    let output = seqviz_output(&db, &["purchase", "does-not-exist"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown product"));
}

#[test]
fn login_failure_surfaces_store_message_and_hides_password() {
    let db = temp_db_path("login");
    let output = seqviz_output(&db, &["login", "--password", "wrong"]);
    assert_success(&output);
    let value = stdout_json(&output);
    assert_eq!(value["result"]["error"], "Invalid password");

    let output = seqviz_output(&db, &["login"]);
    assert_success(&output);
    let value = stdout_json(&output);
    assert_eq!(value["result"]["outcome"], "completed");
    assert_eq!(value["result"]["value"]["email"], "demo@breakthru.dev");
    assert!(value["result"]["value"].get("password").is_none());
}

#[test]
fn cart_persists_between_invocations() {
    let db = temp_db_path("cart");
    let first = seqviz_output(&db, &["cart", "add", "wear-1"]);
    assert_success(&first);
    assert_eq!(stdout_json(&first)["result"]["value"], 1);

    let second = seqviz_output(&db, &["cart", "add", "wear-1"]);
    assert_success(&second);
    assert_eq!(stdout_json(&second)["result"]["value"], 2);

    let removed = seqviz_output(&db, &["cart", "remove", "wear-1"]);
    assert_success(&removed);
    assert_eq!(stdout_json(&removed)["result"]["value"], 0);
}

#[test]
fn signup_then_duplicate_signup_fails() {
    let db = temp_db_path("signup");
    let args = [
        "signup",
        "--email",
        "new@example.com",
        "--password",
        "pw",
        "--name",
        "New Person",
    ];
    let output = seqviz_output(&db, &args);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["result"]["kind"], "auth_signup");
    assert_eq!(stdout_json(&output)["result"]["outcome"], "completed");

    let output = seqviz_output(&db, &args);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["result"]["error"], "Email already exists");
}

#[test]
fn demo_runs_full_tour_once() {
    let db = temp_db_path("demo");
    let output = seqviz_output(&db, &["demo"]);
    assert_success(&output);
    let value = stdout_json(&output);
    assert_eq!(value["result"]["iterations"], 1);
    let runs = value["result"]["runs"].as_array().cloned().unwrap_or_default();
    let kinds: Vec<&str> = runs.iter().filter_map(|run| run["kind"].as_str()).collect();
    assert_eq!(kinds, vec!["search", "search", "cart", "purchase", "auth_login"]);
    assert_eq!(value["snapshot"]["history"].as_array().map(Vec::len), Some(5));
}

#[test]
fn demo_loop_honours_iteration_cap() {
    let db = temp_db_path("demo-loop");
    let output = seqviz_output(
        &db,
        &["--loop-delay-ms", "0", "demo", "--loop", "--iterations", "2"],
    );
    assert_success(&output);
    let value = stdout_json(&output);
    assert_eq!(value["result"]["iterations"], 2);
    assert_eq!(value["result"]["runs"].as_array().map(Vec::len), Some(10));
}

#[test]
fn help_lists_workflow_subcommands() {
    let output = match Command::new(seqviz_binary_path()).arg("--help").output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run seqviz --help: {err}"),
    };
    assert_success(&output);
    let text = String::from_utf8_lossy(&output.stdout);
    for name in [
        "login", "signup", "search", "purchase", "cart", "filter", "logout", "products", "demo",
    ] {
        assert!(text.contains(name), "help output missing {name}: {text}");
    }
}
