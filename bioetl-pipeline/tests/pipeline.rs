use std::path::Path;
use std::process::Command;

use bioetl_common::determinism::sha256_hex;
use bioetl_pipeline::config::parse_config;
use bioetl_pipeline::error::Stage;
use bioetl_pipeline::orchestrator::Pipeline;
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{json, Value};
use tempfile::TempDir;

fn config(server: &MockServer, out: &Path) -> String {
    format!(
        r#"
run:
  name: activity
  entity: activity
  seed: 11
  max_concurrent_sources: 2
http:
  global:
    max_attempts: 1
    rate_limit_calls: 1000
    jitter: false
sources:
  - name: primary
    base_url: {base}
    path: /activities
    page_size: 2
    unique_key: activity_id
    records_field: results
    pagination:
      type: page_number
  - name: secondary
    base_url: {base}
    path: /extra
    page_size: 2
    records_field: data.items
    pagination:
      type: offset
schema:
  identifier: chembl.activity
  declared_version: 1.0.0
  manifest:
    schemas:
      - identifier: chembl.activity
        version: 1.0.0
        columns: [activity_id, standard_type, value_old, recorded]
        required: [activity_id, value_old, recorded]
        business_key: [activity_id]
      - identifier: chembl.activity
        version: 2.0.0
        columns: [activity_id, standard_type, value, recorded]
        required: [activity_id, value, recorded]
        business_key: [activity_id]
        checks:
          - column: value
            check: range
            min: 0
    migrations:
      - identifier: chembl.activity
        from: 1.0.0
        to: 2.0.0
        steps:
          - rename: {{ from: value_old, to: value }}
transform:
  fields:
    activity_id: activity_id
    standard_type: standard_type
    value_old: data.value
    recorded: recorded
determinism:
  sort_by:
    - column: activity_id
  date_columns: [recorded]
qc:
  categorical_columns: [standard_type]
output:
  dir: {out}
  file_stem: activity
"#,
        base = server.base_url(),
        out = out.display(),
    )
}

fn serve_activities(server: &MockServer) -> Vec<Mock<'_>> {
    let page_one = json!({"results": [
        {"activity_id": 3, "standard_type": "IC50", "data": {"value": 1.5}, "recorded": "2024/01/02"},
        {"activity_id": 1, "standard_type": "Ki", "data": {"value": 20.0}, "recorded": "2024-01-01"}
    ]});
    let page_two = json!({"results": [
        {"activity_id": 2, "standard_type": " IC50 ", "data": {"value": 3}, "recorded": "02.01.2024"}
    ]});
    let extra = json!({"data": {"items": [
        {"activity_id": 4, "data": {"value": 0.1234567}, "recorded": "2024-01-03T10:00:00+00:00"}
    ]}});

    vec![
        server.mock(|when, then| {
            when.method(GET).path("/activities").query_param("page", "1");
            then.status(200).json_body(page_one);
        }),
        server.mock(|when, then| {
            when.method(GET).path("/activities").query_param("page", "2");
            then.status(200).json_body(page_two);
        }),
        server.mock(|when, then| {
            when.method(GET).path("/extra").query_param("offset", "0");
            then.status(200).json_body(extra);
        }),
        server.mock(|when, then| {
            when.method(GET).path("/extra").query_param("offset", "2");
            then.status(200).json_body(json!({"data": {"items": []}}));
        }),
    ]
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_full_run_writes_canonical_sorted_output() {
    let server = MockServer::start();
    let mocks = serve_activities(&server);
    let out = TempDir::new().unwrap();

    let config = parse_config(&config(&server, out.path()), &[]).unwrap();
    let run = Pipeline::new(config).unwrap().run().await.unwrap();

    for mock in &mocks {
        mock.assert_hits(1);
    }
    assert_eq!(run.pages_fetched, 3);
    assert_eq!(run.schema.migrations_applied, 1);
    assert_eq!(run.schema.final_version.to_string(), "2.0.0");
    assert_eq!(run.output.rows, 4);

    let csv = std::fs::read_to_string(&run.output.csv).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines[0],
        "activity_id,standard_type,value,recorded,hash_row,hash_business_key"
    );
    assert!(lines[1].starts_with("1,Ki,20,2024-01-01,"), "{}", lines[1]);
    assert!(lines[2].starts_with("2,IC50,3,2024-01-02,"), "{}", lines[2]);
    assert!(lines[3].starts_with("3,IC50,1.5,2024-01-02,"), "{}", lines[3]);
    assert!(lines[4].starts_with("4,,0.123457,2024-01-03T10:00:00Z,"), "{}", lines[4]);
    assert_eq!(lines.len(), 5);

    let meta = read_json(&run.output.meta);
    assert_eq!(meta["schema_version"], json!("2.0.0"));
    assert_eq!(meta["row_count"], json!(4));
    assert_eq!(meta["migrations_applied"], json!(["1.0.0->2.0.0"]));
    assert_eq!(meta["config_hash"], json!(run.config_hash));
    assert_eq!(meta["pages_fetched"], json!(3));
    assert_eq!(meta["csv_sha256"], json!(sha256_hex(csv.as_bytes())));

    let report = read_json(&run.output.quality_report);
    assert_eq!(report["metrics"]["duplicates"]["count"], json!(0));
    assert_eq!(
        report["metrics"]["categorical"]["standard_type"][0],
        json!({"value": "IC50", "count": 2})
    );
    assert_eq!(report["violations"], json!([]));
}

#[tokio::test]
async fn test_two_runs_are_byte_identical() {
    let server = MockServer::start();
    let _mocks = serve_activities(&server);
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();

    let a = Pipeline::new(parse_config(&config(&server, first.path()), &[]).unwrap())
        .unwrap()
        .run()
        .await
        .unwrap();
    let b = Pipeline::new(parse_config(&config(&server, second.path()), &[]).unwrap())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(&a.output.csv).unwrap(),
        std::fs::read(&b.output.csv).unwrap()
    );
    assert_eq!(a.output.csv_sha256, b.output.csv_sha256);
    // output.dir is not part of the fingerprint
    assert_eq!(a.config_hash, b.config_hash);
    assert_ne!(a.run_id, b.run_id);
}

#[tokio::test]
async fn test_limit_and_sample() {
    let server = MockServer::start();
    let _mocks = serve_activities(&server);
    let out = TempDir::new().unwrap();

    let limited = parse_config(
        &config(&server, out.path()),
        &["run.limit=1".to_string()],
    )
    .unwrap();
    let run = Pipeline::new(limited).unwrap().run().await.unwrap();
    // one record from each source, and only the first page of each was needed
    assert_eq!(run.output.rows, 2);
    assert_eq!(run.pages_fetched, 2);

    let sampled = parse_config(
        &config(&server, out.path()),
        &["run.sample=3".to_string()],
    )
    .unwrap();
    let first = Pipeline::new(sampled.clone()).unwrap().run().await.unwrap();
    let first_csv = std::fs::read(&first.output.csv).unwrap();
    let second = Pipeline::new(sampled).unwrap().run().await.unwrap();
    assert_eq!(first.output.rows, 3);
    assert_eq!(first_csv, std::fs::read(&second.output.csv).unwrap());
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let server = MockServer::start();
    let mocks = serve_activities(&server);
    let out = TempDir::new().unwrap();
    let target = out.path().join("not-created");

    let pipeline = Pipeline::new(parse_config(&config(&server, &target), &[]).unwrap()).unwrap();
    let plan = pipeline.plan().unwrap();

    assert_eq!(plan.sources.len(), 2);
    assert_eq!(plan.sources[1].pagination, "offset");
    assert_eq!(plan.schema.migrations, vec!["1.0.0->2.0.0"]);
    assert_eq!(plan.outputs[0], target.join("activity.csv"));
    for mock in &mocks {
        mock.assert_hits(0);
    }
    assert!(!target.exists());
}

#[tokio::test]
async fn test_validation_failure_reports_stage_and_progress() {
    let server = MockServer::start();
    let _mocks = serve_activities(&server);
    let out = TempDir::new().unwrap();
    let target = out.path().join("out");

    let config = parse_config(
        &config(&server, &target),
        &["schema.allow_migration=false".to_string()],
    )
    .unwrap();
    let err = Pipeline::new(config).unwrap().run().await.unwrap_err();

    assert_eq!(err.stage, Stage::Validate);
    assert_eq!(err.progress.pages_fetched, 3);
    assert_eq!(err.progress.rows_validated, 0);
    let msg = err.to_string();
    assert!(msg.starts_with("validate stage failed"), "{msg}");
    assert!(msg.contains("1.0.0"), "{msg}");
    assert!(msg.contains("2.0.0"), "{msg}");
    assert!(!target.exists());
}

#[tokio::test]
async fn test_blank_required_value_fails_validation() {
    let server = MockServer::start();
    // registered first, so it shadows the regular second page
    let blank = server.mock(|when, then| {
        when.method(GET).path("/activities").query_param("page", "2");
        then.status(200).json_body(json!({"results": [
            {"activity_id": 2, "standard_type": "IC50", "data": {"value": 3}, "recorded": "   "}
        ]}));
    });
    let _mocks = serve_activities(&server);
    let out = TempDir::new().unwrap();
    let target = out.path().join("out");

    let config = parse_config(&config(&server, &target), &[]).unwrap();
    let err = Pipeline::new(config).unwrap().run().await.unwrap_err();

    blank.assert_hits(1);
    assert_eq!(err.stage, Stage::Validate);
    assert_eq!(err.progress.rows_validated, 0);
    let msg = err.to_string();
    assert!(msg.contains("recorded"), "{msg}");
    assert!(msg.contains("required"), "{msg}");
    assert!(!target.exists());
}

#[tokio::test]
async fn test_extract_failure_names_the_source() {
    let server = MockServer::start();
    let missing = server.mock(|when, then| {
        when.method(GET).path("/activities");
        then.status(404);
    });
    let _extra = server.mock(|when, then| {
        when.method(GET).path("/extra");
        then.status(200).json_body(json!({"data": {"items": []}}));
    });
    let out = TempDir::new().unwrap();
    let target = out.path().join("out");

    let config = parse_config(&config(&server, &target), &[]).unwrap();
    let err = Pipeline::new(config).unwrap().run().await.unwrap_err();

    missing.assert_hits(1);
    assert_eq!(err.stage, Stage::Extract);
    assert!(err.to_string().contains("source 'primary'"), "{err}");
    assert!(!target.exists());
}

#[tokio::test]
async fn test_threshold_violation_blocks_write() {
    let server = MockServer::start();
    let _mocks = serve_activities(&server);
    let out = TempDir::new().unwrap();
    let target = out.path().join("out");

    let config = parse_config(
        &config(&server, &target),
        &[
            "qc.fail_on_threshold=true".to_string(),
            "qc.thresholds.max_missing_ratio=0.1".to_string(),
        ],
    )
    .unwrap();
    let err = Pipeline::new(config).unwrap().run().await.unwrap_err();

    assert_eq!(err.stage, Stage::Write);
    assert_eq!(err.progress.rows_validated, 4);
    assert!(err.to_string().contains("missing_ratio of column 'standard_type'"), "{err}");
    assert!(!target.exists());
}

#[test]
fn test_cli_exit_codes() {
    let dir = TempDir::new().unwrap();
    let bad = dir.path().join("bad.yaml");
    std::fs::write(
        &bad,
        "run: { name: x, entity: x }\nsources: []\nschema: { identifier: x, declared_version: nope }\noutput: { dir: /tmp, file_stem: x }\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_bioetl"))
        .args(["validate-config", "--config"])
        .arg(&bad)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config stage failed"), "{stderr}");
    assert!(stderr.contains("at least one source"), "{stderr}");
    assert!(stderr.contains("schema.declared_version"), "{stderr}");

    let server = MockServer::start();
    let good = dir.path().join("good.yaml");
    std::fs::write(&good, config(&server, &dir.path().join("out"))).unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_bioetl"))
        .args(["run", "--dry-run", "--limit", "5", "--config"])
        .arg(&good)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let plan: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["limit"], json!(5));
    assert!(!dir.path().join("out").exists());
}
