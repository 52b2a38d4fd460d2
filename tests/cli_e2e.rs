#![cfg(any(target_os = "linux", target_os = "macos"))]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

const SCHEMA: &str = r#"openapi: 3.0.3
info:
  title: orders
  version: "1"
paths:
  /orders/{id}:
    get:
      responses:
        200:
          description: found
          content:
            application/json:
              schema:
                type: object
                required: [id]
                properties:
                  id:
                    type: string
                  total:
                    type: integer
                    maximum: 100
"#;

/// Fails only when a null-field mutant is armed, so exactly those are killed.
const TEST_SCRIPT: &str = r#"#!/usr/bin/env sh
sleep "${FAKE_SUITE_SLEEP:-0}"
if [ "$APIMUTANT_INTERCEPT" != "1" ]; then
  echo "interception not activated" >&2
  exit 2
fi
case "$APIMUTANT_MUTANT" in
  *'"null-field"'*)
    echo "FAIL order contract"
    exit 1
    ;;
esac
echo "ok"
exit 0
"#;

struct Fixture {
    _tmp: tempfile::TempDir,
    schema: PathBuf,
    script: PathBuf,
    run_root: PathBuf,
}

fn fixture() -> Fixture {
    let tmp = tempdir().expect("tempdir should be created");
    let schema = tmp.path().join("openapi.yaml");
    fs::write(&schema, SCHEMA).expect("schema should be written");
    let script = tmp.path().join("suite.sh");
    fs::write(&script, TEST_SCRIPT).expect("fake suite should be written");
    let run_root = tmp.path().join("runs");
    Fixture {
        schema,
        script,
        run_root,
        _tmp: tmp,
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("path should be valid utf-8")
}

fn cli(args: &[&str], sleep: Duration) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_apimutant"));
    command
        .args(args)
        .env("FAKE_SUITE_SLEEP", sleep.as_secs_f32().to_string())
        .env("APIMUTANT_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn run_cli(args: &[&str]) -> std::process::Output {
    cli(args, Duration::ZERO)
        .output()
        .expect("cli command should run")
}

fn run_id_from_output(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    text.lines()
        .find_map(|line| line.strip_prefix("run id: "))
        .expect("output should include run id")
        .trim()
        .to_string()
}

#[test]
fn e2e_cli_lists_the_catalog() {
    let fx = fixture();
    let output = run_cli(&["mutants", "--schema", path_arg(&fx.schema), "--json"]);
    assert!(output.status.success());

    let mutants: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("catalog should be valid json");
    let mutants = mutants.as_array().expect("catalog should be an array");
    assert!(!mutants.is_empty());
    assert_eq!(mutants[0]["id"], serde_json::json!("m0000"));

    let filtered = run_cli(&[
        "mutants",
        "--schema",
        path_arg(&fx.schema),
        "--filter",
        "null-field",
    ]);
    assert!(filtered.status.success());
    let text = String::from_utf8_lossy(&filtered.stdout);
    assert_eq!(text.lines().count(), 2);
    assert!(text.lines().all(|line| line.contains("null-field")));
}

#[test]
fn e2e_cli_run_interrupt_resume_report() {
    let fx = fixture();

    let run_child = cli(
        &[
            "run",
            "--schema",
            path_arg(&fx.schema),
            "--run-root",
            path_arg(&fx.run_root),
            "--",
            "sh",
            path_arg(&fx.script),
        ],
        Duration::from_millis(200),
    )
    .spawn()
    .expect("cli run should spawn");

    let child_pid = run_child.id();
    let interrupt = thread::spawn(move || {
        thread::sleep(Duration::from_millis(700));
        let _ = Command::new("kill")
            .arg("-INT")
            .arg(child_pid.to_string())
            .status();
    });

    let run_output = run_child
        .wait_with_output()
        .expect("run command should finish");
    interrupt
        .join()
        .expect("interrupt thread should join cleanly");

    if !run_output.status.success() {
        panic!(
            "run command should checkpoint on interrupt. status={:?}, stdout={:?}, stderr={:?}",
            run_output.status.code(),
            String::from_utf8_lossy(&run_output.stdout),
            String::from_utf8_lossy(&run_output.stderr)
        );
    }

    let run_id = run_id_from_output(&run_output.stdout);
    let config = apimutant::mutation::MutationConfig::default().with_run_root(&fx.run_root);
    let snapshot = apimutant::mutation::load_run_status(&config, &run_id)
        .expect("status should load after interrupt");
    assert!(snapshot.interrupted);
    assert!(!snapshot.completed);
    assert!(
        !snapshot.pending_mutants().is_empty(),
        "interrupt should leave at least one mutant pending or running"
    );

    // No id and no command: both come from the interrupted run's log.
    let resume_output = run_cli(&[
        "resume",
        "--schema",
        path_arg(&fx.schema),
        "--run-root",
        path_arg(&fx.run_root),
    ]);
    assert!(
        resume_output.status.success(),
        "resume failed: {}",
        String::from_utf8_lossy(&resume_output.stderr)
    );
    assert_eq!(run_id_from_output(&resume_output.stdout), run_id);
    let resumed = apimutant::mutation::load_run_status(&config, &run_id)
        .expect("status should load after resume");
    assert!(resumed.completed);
    assert_eq!(resumed.pending_mutants().len(), 0);

    let status_output = run_cli(&["status", run_id.as_str(), "--run-root", path_arg(&fx.run_root)]);
    assert!(status_output.status.success());
    let status_stdout = String::from_utf8_lossy(&status_output.stdout);
    assert!(status_stdout.contains("run id: "));
    assert!(status_stdout.contains("completed: true"));
    assert!(status_stdout.contains("killed=2"));

    let report_output = run_cli(&[
        "report",
        run_id.as_str(),
        "--format",
        "json",
        "--run-root",
        path_arg(&fx.run_root),
    ]);
    assert!(report_output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&report_output.stdout).expect("report should be valid json");
    assert_eq!(report["runId"].as_str(), Some(run_id.as_str()));
    assert_eq!(report["completed"].as_bool(), Some(true));
    assert_eq!(report["killed"].as_u64(), Some(2));
    assert_eq!(report["errored"].as_u64(), Some(0));
    let total = report["total"].as_u64().expect("total");
    assert_eq!(report["discovered"].as_u64(), Some(total));
    assert_eq!(report["survived"].as_u64(), Some(total - 2));
    assert_eq!(report["byOperator"]["null-field"]["killed"].as_u64(), Some(2));

    let junit = run_cli(&[
        "report",
        run_id.as_str(),
        "--format",
        "junit",
        "--run-root",
        path_arg(&fx.run_root),
    ]);
    assert!(junit.status.success());
    assert!(String::from_utf8_lossy(&junit.stdout).contains("<testsuites>"));
}

#[test]
fn e2e_cli_red_baseline_fails_the_run() {
    let fx = fixture();
    let broken = fx.script.with_file_name("broken.sh");
    fs::write(&broken, "#!/usr/bin/env sh\nexit 1\n").expect("broken suite should be written");

    let output = run_cli(&[
        "run",
        "--schema",
        path_arg(&fx.schema),
        "--run-root",
        path_arg(&fx.run_root),
        "--",
        "sh",
        path_arg(&broken),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("baseline"));
}
