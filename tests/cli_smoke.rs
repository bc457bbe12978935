use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

fn tsk(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tsk").expect("binary");
    cmd.current_dir(dir.path())
        .env("TASKSYNC_STORE", dir.path().join("store.json"))
        .env_remove("TASKSYNC_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().expect("run tsk");
    assert!(
        output.status.success(),
        "tsk failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json output")
}

fn add(dir: &TempDir, args: &[&str]) -> String {
    let value = json_stdout(tsk(dir).arg("add").args(args));
    value["data"]["id"].as_str().expect("id").to_string()
}

#[test]
fn tsk_help_works() {
    Command::cargo_bin("tsk")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("tsk"));
}

#[test]
fn subcommand_help_works() {
    for cmd in ["add", "list", "show", "edit", "rm", "move", "stats", "usage", "watch"] {
        Command::cargo_bin("tsk")
            .expect("binary")
            .arg(cmd)
            .arg("--help")
            .assert()
            .success();
    }
}

#[test]
fn added_tasks_are_listed_newest_first() {
    let dir = TempDir::new().unwrap();
    let first = add(&dir, &["Write release notes"]);
    let second = add(
        &dir,
        &["Ship v2", "--priority", "high", "--status", "in-progress", "--due", "2030-01-15"],
    );

    let listed = json_stdout(tsk(&dir).arg("list"));
    assert_eq!(listed["schema_version"], "tasksync.v1");
    assert_eq!(listed["command"], "list");
    assert_eq!(listed["status"], "success");
    assert_eq!(listed["data"]["total"], 2);
    let tasks = listed["data"]["tasks"].as_array().unwrap();
    assert_eq!(tasks[0]["id"], second.as_str());
    assert_eq!(tasks[0]["priority"], "high");
    assert_eq!(tasks[0]["status"], "in_progress");
    assert_eq!(tasks[1]["id"], first.as_str());
    assert_eq!(tasks[1]["priority"], "medium");
    assert_eq!(tasks[1]["status"], "to_do");
}

#[test]
fn list_filters_and_sorts() {
    let dir = TempDir::new().unwrap();
    add(&dir, &["alpha", "--priority", "low"]);
    add(&dir, &["beta", "--priority", "high", "--description", "needs review"]);
    add(&dir, &["gamma", "--priority", "high"]);

    let high = json_stdout(tsk(&dir).args(["list", "--priority", "high", "--sort", "title", "--asc"]));
    let titles: Vec<&str> = high["data"]["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|task| task["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["beta", "gamma"]);

    let searched = json_stdout(tsk(&dir).args(["list", "--search", "REVIEW"]));
    assert_eq!(searched["data"]["total"], 1);
    assert_eq!(searched["data"]["tasks"][0]["title"], "beta");
}

#[test]
fn edit_move_and_remove() {
    let dir = TempDir::new().unwrap();
    let id = add(&dir, &["Draft", "--due", "2030-02-01", "--link", "https://example.com/1"]);

    let edited = json_stdout(tsk(&dir).args(["edit", id.as_str(), "--title", "Final", "--clear-due"]));
    assert_eq!(edited["data"]["title"], "Final");
    assert!(edited["data"].get("due_date").is_none());
    assert_eq!(edited["data"]["external_link"], "https://example.com/1");

    // A unique prefix is enough to address a task.
    let moved = json_stdout(tsk(&dir).args(["move", &id[..12], "done"]));
    assert_eq!(moved["data"]["status"], "done");

    let shown = json_stdout(tsk(&dir).args(["show", id.as_str()]));
    assert_eq!(shown["data"]["status"], "done");
    assert_eq!(shown["data"]["title"], "Final");

    tsk(&dir).args(["rm", id.as_str()]).assert().success();
    tsk(&dir).args(["show", id.as_str()]).assert().code(2);
}

#[test]
fn user_errors_exit_with_code_two() {
    let dir = TempDir::new().unwrap();
    tsk(&dir).args(["add", "   "]).assert().code(2);
    tsk(&dir)
        .args(["add", "x", "--priority", "urgent"])
        .assert()
        .code(2)
        .stderr(contains("unknown priority"));
    tsk(&dir).args(["add", "x", "--due", "soon"]).assert().code(2);
    tsk(&dir).args(["rm", "missing"]).assert().code(2);

    let id = add(&dir, &["unchanged"]);
    tsk(&dir).args(["edit", id.as_str()]).assert().code(2);
}

#[test]
fn json_errors_use_the_envelope() {
    let dir = TempDir::new().unwrap();
    let output = tsk(&dir)
        .args(["show", "nope", "--json"])
        .output()
        .expect("run tsk");
    assert_eq!(output.status.code(), Some(2));
    let value: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["status"], "error");
    assert_eq!(value["command"], "show");
    assert_eq!(value["error"]["kind"], "user_error");
    assert_eq!(value["error"]["details"]["id"], "nope");
    assert_eq!(value["next_steps"][0], "tsk list");
}

#[test]
fn usage_and_stats_report_the_store() {
    let dir = TempDir::new().unwrap();
    add(&dir, &["one", "--status", "done"]);
    add(&dir, &["two", "--due", "2000-01-01"]);

    let usage = json_stdout(tsk(&dir).arg("usage"));
    assert_eq!(usage["data"]["quota_bytes"], 102400);
    assert!(usage["data"]["bytes_in_use"].as_u64().unwrap() > 0);

    let stats = json_stdout(tsk(&dir).arg("stats"));
    assert_eq!(stats["data"]["total"], 2);
    assert_eq!(stats["data"]["overdue"], 1);
    assert_eq!(stats["data"]["by_status"]["done"], 1);
    assert_eq!(stats["data"]["by_status"]["to_do"], 1);
    assert_eq!(stats["data"]["by_status"]["backlog"], 0);
}

#[test]
fn config_file_controls_fragment_size() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(".tasksync.toml"),
        "[storage]\nfragment_size = 64\ndebounce_ms = 10\n",
    )
    .unwrap();
    add(&dir, &["a task with a fairly long title to spill over"]);

    let raw = fs::read_to_string(dir.path().join("store.json")).unwrap();
    let document: Value = serde_json::from_str(&raw).unwrap();
    let items = &document["items"];
    let chunks = items["tm_meta"]["chunks"].as_u64().unwrap();
    assert!(chunks > 1);
    for index in 0..chunks {
        assert!(items.get(format!("tm_tasks_{index}")).is_some());
    }
}

#[test]
fn invalid_config_is_a_user_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".tasksync.toml"), "[storage]\nfragment_size = 0\n").unwrap();
    tsk(&dir)
        .arg("list")
        .assert()
        .code(2)
        .stderr(contains("fragment_size"));
}

#[test]
fn events_are_written_as_json_lines() {
    let dir = TempDir::new().unwrap();
    let events = dir.path().join("events.jsonl");
    tsk(&dir)
        .args(["add", "observed", "--events"])
        .arg(&events)
        .assert()
        .success();

    let raw = fs::read_to_string(&events).unwrap();
    let kinds: Vec<String> = raw
        .lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["schema_version"], "tasksync.event.v1");
            value["event"].as_str().unwrap().to_string()
        })
        .collect();
    assert!(kinds.contains(&"task_created".to_string()));
    assert!(kinds.contains(&"tasks_changed".to_string()));
}
