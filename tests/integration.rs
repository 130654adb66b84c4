use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const PROVERBS: &str = r#"<book title="Proverbs">
  <chapter n="1" name="Chapter One!">
    <verse n="1">The fear of the Lord is the beginning of knowledge. Fools despise wisdom.</verse>
    <verse n="2">Hear, my son, your father's instruction.</verse>
  </chapter>
  <chapter n="2" name="Chapter Two">
    <verse n="1">Wisdom cries aloud in the street.</verse>
  </chapter>
</book>
"#;

const PROVERBS_RULES: &str = r#"{
  "path_prefix": "PRV",
  "units": [
    {"select": ".//chapter", "kind": "chapter", "path_attr": "@n", "label_attr": "@name"},
    {"select": ".//verse", "kind": "verse", "parent_kind": "chapter",
     "path_scheme": "PRV.{meta[ch]}.{ordinal:02d}",
     "meta": {"ch": "../@n"}, "ordinal_path": "@n"}
  ]
}"#;

const PANELS: &str = r#"{"panel_type": "camera_shot", "text": "INT. TRAILER - NIGHT", "shot_id": "1A"}
{"panel_type": "subtitle", "text": "Where are we?", "seconds_in": 12}
{"panel_type": "scene_unit", "text": "She looks out the window."}
not json at all
{"panel_type": "subtitle", "text": "Still here.", "seconds_in": 20}
{"panel_type": "camera_shot", "text": "EXT. DESERT - DAY"}
{"panel_type": "subtitle", "text": "Morning.", "seconds_in": 400}
{"panel_type": "subtitle", "text": "Night again.", "seconds_in": 500}
"#;

fn trj_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("trj");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    setup_with_extra("")
}

fn setup_with_extra(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(files_dir.join("proverbs.xml"), PROVERBS).unwrap();
    fs::write(files_dir.join("proverbs.json"), PROVERBS_RULES).unwrap();
    fs::write(files_dir.join("panels.jsonl"), PANELS).unwrap();
    fs::write(
        files_dir.join("panels.json"),
        r#"{"path_prefix": "RA", "scene_gap_seconds": 45, "boundary_shot_regex": "^(INT|EXT)\\."}"#,
    )
    .unwrap();
    fs::write(files_dir.join("empty_rules.json"), r#"{"units": []}"#).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/trj.sqlite"

[graph]
alpha = 0.15
dims = 16

[decay]
half_life_days = 45.0
interval_secs = 3600
{}"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("trj.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .to_str()
        .unwrap()
        .to_string()
}

fn run_trj(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = trj_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run trj binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_ok(config_path: &Path, args: &[&str]) -> String {
    let (stdout, stderr, success) = run_trj(config_path, args);
    assert!(
        success,
        "{:?} failed: stdout={}, stderr={}",
        args, stdout, stderr
    );
    stdout
}

fn load_proverbs(config_path: &Path) {
    run_ok(config_path, &["init"]);
    let xml = file(config_path, "proverbs.xml");
    run_ok(
        config_path,
        &["load", "bible", "proverbs", &xml, "--format", "markup", "--session-hint", "prv"],
    );
}

fn explode_proverbs(config_path: &Path) -> String {
    let rules = file(config_path, "proverbs.json");
    run_ok(
        config_path,
        &["explode", "markup", "bible", "proverbs", "--rules", &rules],
    )
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let stdout = run_ok(&config_path, &["init"]);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_trj(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_trj(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_explode_markup_counts_by_kind() {
    let (_tmp, config_path) = setup_test_env();
    load_proverbs(&config_path);

    let stdout = explode_proverbs(&config_path);
    assert!(stdout.contains("inserted: 5"), "stdout={}", stdout);
    assert!(stdout.contains("chapter: 2"));
    assert!(stdout.contains("verse: 3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_explode_markup_replaces_units() {
    let (_tmp, config_path) = setup_test_env();
    load_proverbs(&config_path);

    explode_proverbs(&config_path);
    let first = run_ok(&config_path, &["units", "PRV"]);
    explode_proverbs(&config_path);
    let second = run_ok(&config_path, &["units", "PRV"]);

    assert!(first.contains("units: 5"), "stdout={}", first);
    assert_eq!(first, second);
    assert!(first.contains("PRV.1.02"));
    assert!(first.contains("Chapter One!"));
}

#[test]
fn test_explode_missing_document() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let rules = file(&config_path, "proverbs.json");
    let (_, stderr, success) = run_trj(
        &config_path,
        &["explode", "markup", "bible", "nowhere", "--rules", &rules],
    );
    assert!(!success);
    assert!(stderr.contains("nowhere"), "stderr={}", stderr);
}

#[test]
fn test_explode_rejects_empty_ruleset() {
    let (_tmp, config_path) = setup_test_env();
    load_proverbs(&config_path);

    let rules = file(&config_path, "empty_rules.json");
    let (_, stderr, success) = run_trj(
        &config_path,
        &["explode", "markup", "bible", "proverbs", "--rules", &rules],
    );
    assert!(!success);
    assert!(stderr.contains("units"), "stderr={}", stderr);

    let listing = run_ok(&config_path, &["units", "PRV"]);
    assert!(listing.contains("units: 0"));
}

#[test]
fn test_explode_records_segments_scenes() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let jsonl = file(&config_path, "panels.jsonl");
    run_ok(
        &config_path,
        &["load", "film", "ra", &jsonl, "--format", "records"],
    );
    let rules = file(&config_path, "panels.json");
    let stdout = run_ok(
        &config_path,
        &["explode", "records", "film", "ra", "--rules", &rules],
    );
    // Bootstrap scene, then one scene per shot boundary, then the 100s subtitle gap.
    assert!(stdout.contains("scenes: 4"), "stdout={}", stdout);
    assert!(stdout.contains("skipped_lines: 1"));

    let listing = run_ok(&config_path, &["units", "RA.S002"]);
    assert!(listing.contains("RA.S002\t"));
}

#[test]
fn test_ingest_text_chains_edges() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let stdout = run_ok(
        &config_path,
        &[
            "ingest",
            "text",
            "essays",
            "First thought. Second thought! Third thought?",
            "--session",
            "s1",
            "--channel",
            "rhetoric",
        ],
    );
    assert!(stdout.contains("session_id: s1"));
    assert!(stdout.contains("sentences: 3"));
    assert!(stdout.contains("moves: 3"));
    assert!(stdout.contains("edges: 2"));
}

#[test]
fn test_ingest_text_all_channels() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let stdout = run_ok(&config_path, &["ingest", "text", "essays", "One. Two."]);
    assert!(stdout.contains("session_id: essays_"));
    assert!(stdout.contains("moves: 6"));
    assert!(stdout.contains("edges: 3"));
}

#[test]
fn test_ingest_units_by_pattern() {
    let (_tmp, config_path) = setup_test_env();
    load_proverbs(&config_path);
    explode_proverbs(&config_path);

    let stdout = run_ok(
        &config_path,
        &["ingest", "units", "PRV.*", "--kind", "verse", "--channel", "imagery"],
    );
    assert!(stdout.contains("units: 3"), "stdout={}", stdout);
    assert!(stdout.contains("moves: 3"));
    assert!(stdout.contains("edges: 2"));
}

#[test]
fn test_process_corpus() {
    let (_tmp, config_path) = setup_test_env();
    load_proverbs(&config_path);

    let stdout = run_ok(&config_path, &["process-corpus", "--domain", "bible"]);
    // book + 2 chapters + 3 verses
    assert!(stdout.contains("processed_units: 6"), "stdout={}", stdout);
    assert!(stdout.contains("documents_seen: 1"));

    let listing = run_ok(&config_path, &["units", "book.001", "--kind", "verse"]);
    assert!(listing.contains("book.001.chapter.002.verse.001"));
}

#[test]
fn test_process_corpus_requires_selection() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let (_, _, success) = run_trj(&config_path, &["process-corpus"]);
    assert!(!success);
}

#[test]
fn test_concept_trajectories() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    for key in ["greet", "ask", "thank"] {
        run_ok(&config_path, &["concept", "add", key, "0.1,0.2,0.3"]);
    }
    run_ok(&config_path, &["concept", "observe", "s1", "greet", "ask", "thank"]);
    run_ok(&config_path, &["concept", "observe", "s2", "greet", "ask"]);
    let observed = run_ok(
        &config_path,
        &["concept", "observe", "s3", "greet", "thank", "--outcome", "short"],
    );
    assert!(observed.contains("observations: 2"));
    assert!(observed.contains("transitions: 1"));

    let stdout = run_ok(&config_path, &["concept", "predict", "greet"]);
    assert!(stdout.contains("predictions: 2"));
    let ask = stdout.find("ask").unwrap();
    let thank = stdout.find("thank").unwrap();
    assert!(ask < thank, "stdout={}", stdout);
}

#[test]
fn test_concept_observe_unknown_key_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    run_ok(&config_path, &["concept", "add", "greet", "1.0"]);

    let (_, stderr, success) =
        run_trj(&config_path, &["concept", "observe", "s1", "greet", "ghost"]);
    assert!(!success);
    assert!(stderr.contains("ghost"), "stderr={}", stderr);
}

#[test]
fn test_decay_once_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    run_ok(
        &config_path,
        &["ingest", "text", "essays", "A. B. C.", "--channel", "rhetoric"],
    );

    let stdout = run_ok(&config_path, &["decay", "once"]);
    assert!(stdout.contains("edges_scanned: 2"), "stdout={}", stdout);
    // Nothing has aged yet.
    assert!(stdout.contains("edges_updated: 0"));
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = setup_test_env();
    load_proverbs(&config_path);
    explode_proverbs(&config_path);

    let stdout = run_ok(&config_path, &["stats"]);
    assert!(stdout.contains("Units:         5"), "stdout={}", stdout);
    assert!(stdout.contains("bible"));
}

#[test]
fn test_config_rejects_unknown_channel() {
    let (_tmp, config_path) = setup_with_extra("\n[channels]\nenabled = [\"tone\"]\n");

    let (_, stderr, success) = run_trj(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("tone"), "stderr={}", stderr);
}

#[test]
fn test_configured_channels_apply() {
    let (_tmp, config_path) = setup_with_extra("\n[channels]\nenabled = [\"lexico_semantic\"]\n");
    run_ok(&config_path, &["init"]);

    let stdout = run_ok(&config_path, &["ingest", "text", "essays", "One. Two."]);
    assert!(stdout.contains("moves: 2"), "stdout={}", stdout);
    assert!(stdout.contains("edges: 1"));
}
