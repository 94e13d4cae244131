//! CLI subprocess integration tests.
//!
//! These tests invoke the `stockpile` binary as a subprocess and verify
//! exit codes, stdout content, and JSON output stability. Repositories are
//! served by an in-process `stockpile-server`.

use chrono::{TimeZone, Utc};
use std::path::Path;
use std::process::{Command, Output};
use stockpile_schema::{ContentHash, ItemId, Repository, RepositoryItem, SourceUri};
use stockpile_server::TestServer;
use uuid::Uuid;

const PAYLOAD: &[u8] = b"stockpile test package payload";

fn stockpile_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_stockpile"));
    cmd.env_remove("STOCKPILE_LOG");
    cmd
}

fn temp_store() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

fn run(store: &Path, args: &[&str]) -> Output {
    stockpile_bin()
        .arg("--store")
        .arg(store)
        .args(args)
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("output must be valid JSON: {e}\nstdout: {stdout}"))
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} must exit 0. stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn item(id: &str, version_code: u64, source: &str, payload: &[u8]) -> RepositoryItem {
    RepositoryItem {
        id: ItemId::new(id),
        version_code,
        version_name: format!("{version_code}.0"),
        name: format!("Item {id}"),
        source: SourceUri::new(source),
        hash: ContentHash::of_bytes(payload),
    }
}

/// Serve a one-item repository and return the server with its temp dir.
fn serve_repository(items: Vec<RepositoryItem>) -> (TestServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().join("site")).unwrap();
    server.site().put_file("packages/tool.pkg", PAYLOAD).unwrap();
    let repo = Repository {
        id: Uuid::from_u128(0xc11),
        title: "Test Repository".to_owned(),
        updated: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        self_uri: SourceUri::new(server.manifest_url()),
        items,
    };
    server.site().publish(&repo).unwrap();
    (server, dir)
}

#[test]
fn cli_version_exits_zero() {
    let output = stockpile_bin().arg("--version").output().unwrap();
    assert!(output.status.success(), "stockpile --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("stockpile"),
        "version output must contain 'stockpile': {stdout}"
    );
}

#[test]
fn cli_help_lists_commands() {
    let output = stockpile_bin().arg("--help").output().unwrap();
    assert!(output.status.success(), "stockpile --help must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["repo", "update", "install", "uninstall", "verify-cache"] {
        assert!(stdout.contains(command), "help must list '{command}'");
    }
}

#[test]
fn cli_repo_add_and_list_json() {
    let store = temp_store();
    let added = run(
        store.path(),
        &["--json", "repo", "add", "http://127.0.0.1:9/repository.json"],
    );
    assert_success(&added, "repo add");
    let info = stdout_json(&added);
    assert_eq!(info["address"], "http://127.0.0.1:9/repository.json");
    assert_eq!(info["enabled"], true);
    assert_eq!(info["items"], 0);

    let listed = run(store.path(), &["--json", "repo", "list"]);
    assert_success(&listed, "repo list");
    let repos = stdout_json(&listed);
    let arr = repos.as_array().unwrap();
    assert_eq!(arr.len(), 1);
    assert_eq!(arr[0]["id"], info["id"]);
    assert_eq!(arr[0]["state"]["state"], "idle");
}

#[test]
fn cli_repo_add_rejects_duplicate_and_bad_address() {
    let store = temp_store();
    let address = "http://127.0.0.1:9/repository.json";
    assert_success(&run(store.path(), &["repo", "add", address]), "repo add");

    let duplicate = run(store.path(), &["repo", "add", address]);
    assert_eq!(duplicate.status.code(), Some(1));

    let bad = run(store.path(), &["repo", "add", "ftp://example.org/repo.json"]);
    assert_eq!(bad.status.code(), Some(1));
}

#[test]
fn cli_repo_remove_by_title() {
    let store = temp_store();
    assert_success(
        &run(
            store.path(),
            &[
                "repo",
                "add",
                "http://127.0.0.1:9/r.json",
                "--title",
                "Local",
            ],
        ),
        "repo add",
    );
    let removed = run(store.path(), &["--json", "repo", "remove", "Local"]);
    assert_success(&removed, "repo remove");
    assert_eq!(stdout_json(&removed)["title"], "Local");

    let listed = run(store.path(), &["--json", "repo", "list"]);
    assert!(stdout_json(&listed).as_array().unwrap().is_empty());
}

#[test]
fn cli_disabled_repository_is_not_updated() {
    let store = temp_store();
    std::fs::write(
        store.path().join("config.toml"),
        "retries = 0\nretry_pause_secs = 0\n",
    )
    .unwrap();
    assert_success(
        &run(
            store.path(),
            &[
                "repo",
                "add",
                "http://127.0.0.1:9/r.json",
                "--title",
                "Offline",
            ],
        ),
        "repo add",
    );
    let disabled = run(store.path(), &["--json", "repo", "disable", "Offline"]);
    assert_success(&disabled, "repo disable");
    assert_eq!(stdout_json(&disabled)["enabled"], false);

    let listed = run(store.path(), &["--json", "repo", "list"]);
    assert_eq!(stdout_json(&listed)[0]["enabled"], false);

    let skipped = run(store.path(), &["--json", "update"]);
    assert_success(&skipped, "update with every repository disabled");
    assert!(stdout_json(&skipped).as_array().unwrap().is_empty());

    assert_success(&run(store.path(), &["repo", "enable", "Offline"]), "repo enable");
    let attempted = run(store.path(), &["--json", "update"]);
    assert_eq!(attempted.status.code(), Some(1));
    assert_eq!(stdout_json(&attempted)[0]["status"], "failed");
}

#[test]
fn cli_list_empty_store() {
    let store = temp_store();
    let output = run(store.path(), &["--json", "list"]);
    assert_success(&output, "list");
    assert_eq!(stdout_json(&output), serde_json::json!([]));
}

#[test]
fn cli_verify_cache_empty_store() {
    let store = temp_store();
    let output = run(store.path(), &["--json", "verify-cache"]);
    assert_success(&output, "verify-cache");
    let report = stdout_json(&output);
    assert_eq!(report["checked"], 0);
    assert!(report["failed"].as_array().unwrap().is_empty());
}

#[test]
fn cli_install_unknown_item_fails() {
    let store = temp_store();
    let output = run(store.path(), &["install", "org.example.missing"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("org.example.missing"), "stderr: {stderr}");
}

#[test]
fn cli_uninstall_not_installed_fails() {
    let store = temp_store();
    let output = run(store.path(), &["uninstall", "org.example.missing"]);
    assert!(!output.status.success());
}

#[test]
fn cli_update_unreachable_repository_fails() {
    let store = temp_store();
    std::fs::write(
        store.path().join("config.toml"),
        "retries = 0\nretry_pause_secs = 0\n",
    )
    .unwrap();
    assert_success(
        &run(
            store.path(),
            &["repo", "add", "http://127.0.0.1:9/repository.json"],
        ),
        "repo add",
    );
    let output = run(store.path(), &["--json", "update"]);
    assert_eq!(output.status.code(), Some(1));
    let results = stdout_json(&output);
    assert_eq!(results[0]["status"], "failed");
}

#[test]
fn cli_update_rejects_malformed_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().join("site")).unwrap();
    server
        .site()
        .put_file("repository.json", b"{\"format_version\": 1")
        .unwrap();
    let store = temp_store();
    assert_success(
        &run(store.path(), &["repo", "add", &server.manifest_url()]),
        "repo add",
    );
    let output = run(store.path(), &["update"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_invalid_config_is_rejected() {
    let store = temp_store();
    std::fs::write(store.path().join("config.toml"), "workers = 0\n").unwrap();
    let output = run(store.path(), &["list"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration"), "stderr: {stderr}");
}

#[test]
fn cli_end_to_end_update_install_uninstall() {
    let (server, _site) = serve_repository(vec![item(
        "org.example.tool",
        2,
        "packages/tool.pkg",
        PAYLOAD,
    )]);
    let store = temp_store();

    assert_success(
        &run(store.path(), &["repo", "add", &server.manifest_url()]),
        "repo add",
    );

    let updated = run(store.path(), &["--json", "update"]);
    assert_success(&updated, "update");
    let results = stdout_json(&updated);
    assert_eq!(results[0]["status"], "succeeded");
    assert_eq!(results[0]["visible"], 1);
    assert_eq!(results[0]["title"], "Test Repository");

    let listed = run(store.path(), &["--json", "list"]);
    assert_success(&listed, "list");
    let items = stdout_json(&listed);
    assert_eq!(items[0]["id"], "org.example.tool");
    assert_eq!(items[0]["state"]["state"], "not_installed");

    let installed = run(store.path(), &["--json", "install", "org.example.tool"]);
    assert_success(&installed, "install");
    assert_eq!(stdout_json(&installed)["status"], "succeeded");
    let package = store
        .path()
        .join("installed")
        .join("org.example.tool")
        .join("package.pkg");
    assert_eq!(std::fs::read(package).unwrap(), PAYLOAD);

    let shown = run(store.path(), &["--json", "show", "org.example.tool"]);
    assert_success(&shown, "show");
    let details = stdout_json(&shown);
    assert_eq!(details["item"]["state"]["state"], "installed");
    assert_eq!(details["item"]["state"]["version_code"], 2);

    let only_installed = run(store.path(), &["--json", "list", "--installed"]);
    assert_eq!(stdout_json(&only_installed).as_array().unwrap().len(), 1);

    let removed = run(store.path(), &["--json", "uninstall", "org.example.tool"]);
    assert_success(&removed, "uninstall");
    assert!(!store.path().join("installed").join("org.example.tool").exists());

    let only_installed = run(store.path(), &["--json", "list", "--installed"]);
    assert!(stdout_json(&only_installed).as_array().unwrap().is_empty());
}

#[test]
fn cli_install_retries_transient_server_errors() {
    let (server, _site) = serve_repository(vec![item(
        "org.example.tool",
        1,
        "packages/tool.pkg",
        PAYLOAD,
    )]);
    let store = temp_store();
    std::fs::write(
        store.path().join("config.toml"),
        "retries = 3\nretry_pause_secs = 0\n",
    )
    .unwrap();
    assert_success(
        &run(store.path(), &["repo", "add", &server.manifest_url()]),
        "repo add",
    );
    assert_success(&run(store.path(), &["update"]), "update");

    server.fail_next(2);
    let output = run(store.path(), &["--json", "install", "org.example.tool"]);
    assert_success(&output, "install");
    let steps = stdout_json(&output)["steps"].as_array().unwrap().clone();
    assert!(steps.iter().any(|s| s["failed"] == true), "steps: {steps:?}");
}

#[test]
fn cli_install_corrupt_package_is_store_error() {
    let (server, _site) = serve_repository(vec![item(
        "org.example.tool",
        1,
        "packages/tool.pkg",
        b"different bytes than served",
    )]);
    let store = temp_store();
    assert_success(
        &run(store.path(), &["repo", "add", &server.manifest_url()]),
        "repo add",
    );
    assert_success(&run(store.path(), &["update"]), "update");

    let output = run(store.path(), &["--json", "install", "org.example.tool"]);
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(stdout_json(&output)["status"], "failed");
    assert!(!store.path().join("installed").join("org.example.tool").exists());
}

#[test]
fn cli_update_with_bearer_token() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start_with_token(dir.path().join("site"), "letmein").unwrap();
    let repo = Repository {
        id: Uuid::from_u128(0xa17),
        title: "Private".to_owned(),
        updated: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        self_uri: SourceUri::new(server.manifest_url()),
        items: vec![item("org.example.secret", 1, "s.pkg", PAYLOAD)],
    };
    server.site().publish(&repo).unwrap();

    let store = temp_store();
    std::fs::write(store.path().join("config.toml"), "retries = 0\n").unwrap();
    assert_success(
        &run(
            store.path(),
            &["repo", "add", &server.manifest_url(), "--token", "letmein"],
        ),
        "repo add",
    );
    let output = run(store.path(), &["--json", "update"]);
    assert_success(&output, "update");
    assert_eq!(stdout_json(&output)[0]["visible"], 1);
}

#[test]
fn cli_completions_bash() {
    let output = stockpile_bin().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("stockpile"));
}

#[test]
fn cli_man_pages_written() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("man");
    let output = stockpile_bin()
        .args(["man-pages", &out.to_string_lossy()])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(out.join("stockpile.1").is_file());
    assert!(out.join("stockpile-repo-add.1").is_file());
}
