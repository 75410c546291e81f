use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn marg_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("marg");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let books_dir = root.join("books");
    fs::create_dir_all(books_dir.join("nested")).unwrap();
    fs::write(
        books_dir.join("moby.txt"),
        "Call me Ishmael.\nSome years ago.\nThe white whale\nsurfaced at dawn.\nThe end.",
    )
    .unwrap();
    fs::write(
        books_dir.join("nested/notes.txt"),
        "Harpoons and rope.\nA second line.",
    )
    .unwrap();
    fs::write(books_dir.join("cover.png"), [0u8, 1, 2, 3]).unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{}/data"

[indexing]
max_workers = 2
lines_per_page = 2

[search]
max_results = 10
"#,
        root.display()
    );

    let config_path = config_dir.join("marginalia.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_marg(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = marg_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run marg binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// First whitespace-separated token of the first output line: the id
/// printed for a created annotation.
fn first_id(stdout: &str) -> String {
    stdout
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap()
        .to_string()
}

fn books(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("books")
}

#[test]
fn test_init_creates_databases() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_marg(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("categories:   6"));

    let data = config_path.parent().unwrap().parent().unwrap().join("data");
    assert!(data.join("annotations.db").exists());
    assert!(data.join("search_index.db").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_marg(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (stdout, _, success2) = run_marg(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
    assert!(stdout.contains("categories:   6"));
}

#[test]
fn test_bookmark_lifecycle() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_marg(&config_path, &["bookmark", "add", "moby.epub", "12"]);
    assert!(success, "bookmark add failed: {}", stderr);
    assert!(stdout.contains("Page 12"));
    let id = first_id(&stdout);

    let (stdout, _, _) = run_marg(&config_path, &["bookmark", "list", "moby.epub"]);
    assert!(stdout.contains(&id));

    let (_, _, success) = run_marg(&config_path, &["bookmark", "delete", &id]);
    assert!(success);
    let (_, _, success) = run_marg(&config_path, &["bookmark", "delete", &id]);
    assert!(!success, "deleting twice should fail");

    let (stdout, _, _) = run_marg(&config_path, &["bookmark", "list", "moby.epub"]);
    assert!(stdout.contains("No annotations."));
}

#[test]
fn test_highlight_merge() {
    let (_tmp, config_path) = setup_test_env();

    let (a, _, ok_a) = run_marg(
        &config_path,
        &[
            "highlight", "add", "moby.epub", "3", "--start", "0", "--end", "8", "--text",
            "Call me", "--color", "green",
        ],
    );
    let (b, _, ok_b) = run_marg(
        &config_path,
        &[
            "highlight", "add", "moby.epub", "3", "--start", "9", "--end", "16", "--text",
            "Ishmael",
        ],
    );
    assert!(ok_a && ok_b);

    let (stdout, stderr, success) = run_marg(
        &config_path,
        &["highlight", "merge", &first_id(&a), &first_id(&b)],
    );
    assert!(success, "merge failed: {}", stderr);
    assert!(stdout.contains("[0..16]"));

    let (stdout, _, _) = run_marg(&config_path, &["highlight", "list", "moby.epub"]);
    assert_eq!(stdout.lines().count(), 1);
}

#[test]
fn test_note_thread_and_recursive_delete() {
    let (_tmp, config_path) = setup_test_env();

    let (root, _, _) = run_marg(
        &config_path,
        &["note", "add", "moby.epub", "5", "<b>Who</b> is Ishmael?"],
    );
    let root_id = first_id(&root);
    let (reply, _, success) =
        run_marg(&config_path, &["note", "reply", &root_id, "The narrator."]);
    assert!(success);
    assert!(reply.contains("reply to"));

    let (stdout, _, _) = run_marg(&config_path, &["note", "thread", &root_id]);
    assert!(stdout.contains("Who is Ishmael?"));
    assert!(stdout.contains("The narrator."));

    let (_, _, success) = run_marg(&config_path, &["note", "delete", &root_id]);
    assert!(success);
    let (stdout, _, _) = run_marg(&config_path, &["annotations", "list", "moby.epub"]);
    assert!(stdout.contains("No annotations."));
}

#[test]
fn test_category_add_and_list() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_marg(
        &config_path,
        &["category", "add", "Whaling", "--color", "blue"],
    );
    assert!(success, "category add failed: {}", stderr);
    assert!(stdout.contains("#0080FF"));

    let (_, _, success) = run_marg(&config_path, &["category", "add", "Whaling"]);
    assert!(!success, "duplicate sibling name should be refused");

    let (stdout, _, _) = run_marg(&config_path, &["category", "list"]);
    assert!(stdout.contains("Whaling"));
    assert!(stdout.contains("General"));

    let (stdout, _, _) = run_marg(&config_path, &["category", "template"]);
    assert!(stdout.contains("Available templates:"));
}

#[test]
fn test_export_import_between_stores() {
    let (tmp, config_path) = setup_test_env();
    run_marg(&config_path, &["bookmark", "add", "moby.epub", "7", "--title", "Chase"]);

    let export_path = tmp.path().join("export.json");
    let (_, stderr, success) = run_marg(
        &config_path,
        &[
            "annotations",
            "export",
            "moby.epub",
            "--output",
            export_path.to_str().unwrap(),
        ],
    );
    assert!(success, "export failed: {}", stderr);

    let (_other_tmp, other_config) = setup_test_env();
    let (stdout, stderr, success) = run_marg(
        &other_config,
        &["annotations", "import", export_path.to_str().unwrap()],
    );
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("Imported 1 annotations (0 failed)"));

    let (stdout, _, _) = run_marg(&other_config, &["annotations", "list", "moby.epub"]);
    assert!(stdout.contains("Chase"));
}

#[test]
fn test_annotation_search() {
    let (_tmp, config_path) = setup_test_env();
    run_marg(&config_path, &["note", "add", "moby.epub", "2", "The whale is white"]);
    run_marg(&config_path, &["note", "add", "moby.epub", "4", "Rope and sails"]);

    let (stdout, _, success) = run_marg(&config_path, &["annotations", "search", "whale"]);
    assert!(success);
    assert!(stdout.contains("p.2"));
    assert!(!stdout.contains("p.4"));

    let (_, _, success) = run_marg(
        &config_path,
        &["annotations", "search", "whale", "--type", "scribble"],
    );
    assert!(!success, "unknown type should be rejected");
}

#[test]
fn test_index_add_and_search() {
    let (_tmp, config_path) = setup_test_env();
    let moby = books(&config_path).join("moby.txt");

    let (stdout, stderr, success) = run_marg(
        &config_path,
        &["index", "add", moby.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "index add failed: {}", stderr);
    assert!(stdout.contains("Indexed 1 of 1 documents."));

    let (stdout, _, _) = run_marg(&config_path, &["index", "search", "whale"]);
    assert!(stdout.contains("p.2"), "expected page 2 hit: {}", stdout);

    let (stdout, _, _) = run_marg(&config_path, &["index", "history"]);
    assert!(stdout.contains("whale"));

    let (stdout, _, _) = run_marg(&config_path, &["index", "list"]);
    assert!(stdout.contains("moby.txt  (3 pages)"));

    let (_, _, success) = run_marg(&config_path, &["index", "clear"]);
    assert!(success);
    let (stdout, _, _) = run_marg(&config_path, &["index", "search", "whale"]);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_index_dir_skips_unsupported() {
    let (_tmp, config_path) = setup_test_env();
    let root = books(&config_path);

    let (stdout, stderr, success) = run_marg(
        &config_path,
        &["index", "dir", root.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "index dir failed: {}", stderr);
    assert!(stdout.contains("Indexed 2 documents"));

    let (stdout, _, _) = run_marg(&config_path, &["index", "search", "harpoons"]);
    assert!(stdout.contains("notes.txt"));
}

#[test]
fn test_index_add_unsupported_fails() {
    let (_tmp, config_path) = setup_test_env();
    let png = books(&config_path).join("cover.png");

    let (stdout, _, success) = run_marg(
        &config_path,
        &["index", "add", png.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!success);
    assert!(stdout.contains("Indexed 0 of 1 documents."));
}

#[test]
fn test_backup_and_restore() {
    let (tmp, config_path) = setup_test_env();
    let (stdout, _, _) = run_marg(&config_path, &["bookmark", "add", "moby.epub", "1"]);
    let id = first_id(&stdout);

    let backup = tmp.path().join("snapshot.db");
    let (_, stderr, success) = run_marg(&config_path, &["backup", backup.to_str().unwrap()]);
    assert!(success, "backup failed: {}", stderr);

    run_marg(&config_path, &["bookmark", "delete", &id]);
    let (_, stderr, success) = run_marg(&config_path, &["restore", backup.to_str().unwrap()]);
    assert!(success, "restore failed: {}", stderr);

    let (stdout, _, _) = run_marg(&config_path, &["bookmark", "list", "moby.epub"]);
    assert!(stdout.contains(&id));

    let missing = tmp.path().join("missing.db");
    let (_, _, success) = run_marg(&config_path, &["restore", missing.to_str().unwrap()]);
    assert!(!success);
}

#[test]
fn test_completions() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_marg(&config_path, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("marg"));
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env();
    fs::write(&config_path, "[indexing]\nmax_workers = 0\n").unwrap();
    let (_, stderr, success) = run_marg(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("max_workers"));
}
