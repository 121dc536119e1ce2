//! Integration tests for the run engine.
//!
//! Each test builds a throwaway SQLite database in a temp dir, loads a small
//! corpus, and drives runs through [`Engine`] with scripted in-process
//! classifiers, so the tests exercise the real store, work-set queries,
//! lock files and metrics aggregation without any network.

use anyhow::Result;
use async_trait::async_trait;
use label_harness::classifier::{Classifier, ClassifierError, ClassifyRequest};
use label_harness::config::{load_config, Config};
use label_harness::corpus::{self, CorpusLoader, JsonlLoader};
use label_harness::error::EngineError;
use label_harness::lock::{lock_path, LockInfo};
use label_harness::metrics;
use label_harness::models::{ErrorKind, RunStatus};
use label_harness::parser::JsonVerdictParser;
use label_harness::processor;
use label_harness::registry;
use label_harness::results::{self, WriteMode};
use label_harness::runner::Engine;
use label_harness::worklist::WorkMode;
use label_harness::{db, migrate};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// ─── Test Classifier ────────────────────────────────────────────────

type Respond = dyn Fn(&str) -> Result<String, ClassifierError> + Send + Sync;

/// Answers from a closure over the item text and counts calls.
struct ScriptedClassifier {
    calls: Arc<AtomicUsize>,
    respond: Box<Respond>,
}

impl ScriptedClassifier {
    fn new(
        respond: impl Fn(&str) -> Result<String, ClassifierError> + Send + Sync + 'static,
    ) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                respond: Box::new(respond),
            },
            calls,
        )
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request.text)
    }
}

fn verdict(detected: bool) -> Result<String, ClassifierError> {
    Ok(format!(
        r#"{{"detected": {}, "confidence": 0.9, "indicators": ["x"], "rationale": "scripted"}}"#,
        detected
    ))
}

fn always_true() -> Box<dyn Classifier> {
    Box::new(ScriptedClassifier::new(|_| verdict(true)).0)
}

/// Detects items whose entity number is even: text is "E<n>/<subtype>".
fn even_entities(text: &str) -> Result<String, ClassifierError> {
    let n: u32 = text[1..text.find('/').unwrap()].parse().unwrap();
    verdict(n % 2 == 0)
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct Env {
    _tmp: TempDir,
    config: Config,
    pool: SqlitePool,
}

impl Env {
    fn engine(&self, classifier: Box<dyn Classifier>) -> Engine {
        Engine::with_components(
            self.pool.clone(),
            self.config.clone(),
            classifier,
            Box::new(JsonVerdictParser),
        )
    }

    fn lock_dir(&self) -> std::path::PathBuf {
        self.config.lock_dir()
    }
}

/// Corpus of `(entity_id, subtype, label)`; text is `"<entity_id>/<subtype>"`.
async fn setup(records: &[(&str, &str, Option<bool>)]) -> Env {
    setup_with_limit(records, None).await
}

async fn setup_with_limit(records: &[(&str, &str, Option<bool>)], limit: Option<i64>) -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let limit_line = limit.map(|l| format!("limit = {}\n", l)).unwrap_or_default();
    let config_content = format!(
        r#"[db]
path = "{root}/data/lh.sqlite"

[classifier]
model = "test-model"
temperature = 0.0
seed = 7

[experiment]
name = "test"
source = "test-src"
prompt = "Does this narrative describe the condition? Answer in JSON."
{limit_line}
[locks]
dir = "{root}/locks"

[output]
dir = "{root}/output"
"#,
        root = root.display(),
        limit_line = limit_line,
    );
    let config_path = root.join("lh.toml");
    std::fs::write(&config_path, config_content).unwrap();
    let config = load_config(&config_path).unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();

    let corpus_path = root.join("corpus.jsonl");
    write_corpus(&corpus_path, records);
    JsonlLoader::new(&corpus_path)
        .load(&pool, "test-src")
        .await
        .unwrap();

    Env {
        _tmp: tmp,
        config,
        pool,
    }
}

fn write_corpus(path: &Path, records: &[(&str, &str, Option<bool>)]) {
    let lines: Vec<String> = records
        .iter()
        .map(|(entity, subtype, label)| {
            serde_json::json!({
                "entity_id": entity,
                "subtype": subtype,
                "text": format!("{}/{}", entity, subtype),
                "label": label,
            })
            .to_string()
        })
        .collect();
    std::fs::write(path, lines.join("\n")).unwrap();
}

fn ten_items() -> Vec<(String, Option<bool>)> {
    (1..=10).map(|n| (format!("E{}", n), Some(n % 3 == 0))).collect()
}

async fn setup_ten() -> Env {
    let owned = ten_items();
    let records: Vec<(&str, &str, Option<bool>)> = owned
        .iter()
        .map(|(e, l)| (e.as_str(), "cme", *l))
        .collect();
    setup(&records).await
}

/// Process the first `n` remaining items of `run_id` outside the engine,
/// leaving the run in `running` state as if the process died afterwards.
async fn process_first(
    env: &Env,
    run_id: &str,
    n: usize,
    classifier: &dyn Classifier,
) -> Result<()> {
    let run = registry::require_run(&env.pool, run_id).await?;
    let work = label_harness::worklist::resolve(&env.pool, &run, WorkMode::Normal).await?;
    for record in work.iter().take(n) {
        processor::process_item(
            &env.pool,
            classifier,
            &JsonVerdictParser,
            &run,
            record,
            WriteMode::Insert,
        )
        .await?;
    }
    Ok(())
}

fn engine_error(err: &anyhow::Error) -> &EngineError {
    err.downcast_ref::<EngineError>()
        .unwrap_or_else(|| panic!("expected EngineError, got: {:#}", err))
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn three_item_confusion_matrix() {
    let env = setup(&[
        ("A", "cme", Some(true)),
        ("A", "le", Some(false)),
        ("B", "cme", Some(true)),
    ])
    .await;

    let summary = env.engine(always_true()).start_run().await.unwrap();
    let m = summary.metrics.expect("run should be finalized");

    assert_eq!(m.n_true_positive, 2);
    assert_eq!(m.n_false_positive, 1);
    assert_eq!(m.n_true_negative, 0);
    assert_eq!(m.n_false_negative, 0);
    assert_eq!(m.n_positive_detected, 3);
    assert_eq!(m.n_positive_manual, 2);
    assert_eq!(m.n_negative_manual, 1);
    assert!((m.accuracy.unwrap() - 2.0 / 3.0).abs() < 1e-9);
    assert!((m.precision.unwrap() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(m.recall, Some(1.0));
    assert!((m.f1.unwrap() - 0.8).abs() < 1e-9);

    let run = registry::require_run(&env.pool, &summary.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ended_at.is_some());
    assert_eq!(run.items_processed, 3);
    assert_eq!(
        run.metrics.as_ref().map(|stored| stored.n_true_positive),
        Some(m.n_true_positive)
    );
    assert_eq!(run.artifacts.len(), 2);
    for path in &run.artifacts {
        assert!(Path::new(path).exists(), "missing artifact {}", path);
    }

    let flagged = results::get_result(&env.pool, &summary.run_id, "A", "le")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flagged.is_false_positive(), Some(true));
    assert_eq!(flagged.is_true_positive(), Some(false));

    let results_path = run
        .artifacts
        .iter()
        .find(|p| p.ends_with("results.jsonl"))
        .unwrap();
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(results_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    let le = lines.iter().find(|l| l["subtype"] == "le").unwrap();
    assert_eq!(le["is_false_positive"], true);
    assert_eq!(le["is_true_positive"], false);
    assert_eq!(le["is_true_negative"], false);
    assert_eq!(le["is_false_negative"], false);
}

#[tokio::test]
async fn snapshot_records_resolved_prompt_and_checksum() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();

    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.total_items, 1);
    assert_eq!(run.snapshot.model, "test-model");
    assert_eq!(run.snapshot.seed, Some(7));
    assert!(run.snapshot.prompt.starts_with("Does this narrative"));
    let expected = corpus::checksum(&env.pool, "test-src", None).await.unwrap();
    assert_eq!(run.corpus_checksum.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn resume_does_not_need_the_prompt_file() {
    let env = setup(&[("A", "cme", Some(true)), ("B", "cme", Some(false))]).await;
    let root = env._tmp.path();
    let prompt_path = root.join("prompt.txt");
    std::fs::write(&prompt_path, "Prompt kept in a file.").unwrap();

    let config_path = root.join("lh.toml");
    let original = std::fs::read_to_string(&config_path).unwrap();
    let prompt_line = original
        .lines()
        .find(|l| l.starts_with("prompt = "))
        .unwrap()
        .to_string();
    std::fs::write(
        &config_path,
        original.replace(
            &prompt_line,
            &format!("prompt_file = \"{}\"", prompt_path.display()),
        ),
    )
    .unwrap();

    let engine_for = |config: Config, classifier: Box<dyn Classifier>| {
        Engine::with_components(
            env.pool.clone(),
            config,
            classifier,
            Box::new(JsonVerdictParser),
        )
    };

    let config = load_config(&config_path).unwrap();
    let run = engine_for(config, always_true()).create_run().await.unwrap();
    assert_eq!(run.snapshot.prompt, "Prompt kept in a file.");
    let (classifier, _) = ScriptedClassifier::new(|_| verdict(true));
    process_first(&env, &run.run_id, 1, &classifier).await.unwrap();

    std::fs::remove_file(&prompt_path).unwrap();
    let config = load_config(&config_path).unwrap();

    let summary = engine_for(config.clone(), always_true())
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();
    assert!(summary.finalized());
    assert_eq!(summary.attempted, 1);
    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.snapshot.prompt, "Prompt kept in a file.");

    // A new run still needs the file.
    let err = engine_for(config, always_true()).create_run().await.unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::Config(_)));
}

#[tokio::test]
async fn run_ids_are_unique() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let engine = env.engine(always_true());
    let a = engine.create_run().await.unwrap();
    let b = engine.create_run().await.unwrap();
    assert_ne!(a.run_id, b.run_id);
}

#[tokio::test]
async fn row_limit_restricts_slice() {
    let owned = ten_items();
    let records: Vec<(&str, &str, Option<bool>)> = owned
        .iter()
        .map(|(e, l)| (e.as_str(), "cme", *l))
        .collect();
    let env = setup_with_limit(&records, Some(4)).await;

    let summary = env.engine(always_true()).start_run().await.unwrap();
    assert_eq!(summary.attempted, 4);
    let rows = results::list_results(&env.pool, &summary.run_id).await.unwrap();
    let mut ids: Vec<&str> = rows.iter().map(|r| r.entity_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["E1", "E2", "E3", "E4"]);
}

#[tokio::test]
async fn classifier_failure_is_isolated() {
    let env = setup_ten().await;
    let (classifier, calls) = ScriptedClassifier::new(|text| {
        if text.starts_with("E5/") {
            Err(ClassifierError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        } else {
            verdict(true)
        }
    });

    let summary = env.engine(Box::new(classifier)).start_run().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(summary.attempted, 10);
    assert_eq!(summary.errors, 1);

    let rows = results::list_results(&env.pool, &summary.run_id).await.unwrap();
    assert_eq!(rows.len(), 10);
    for row in &rows {
        if row.entity_id == "E5" {
            assert!(row.error_occurred);
            assert_eq!(row.error_kind, Some(ErrorKind::Transport));
            assert!(row
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("transport failure:"));
            assert_eq!(row.detected, None);
        } else {
            assert!(!row.error_occurred, "{} should be clean", row.entity_id);
            assert_eq!(row.detected, Some(true));
        }
    }

    let m = summary.metrics.unwrap();
    assert_eq!(m.n_errors, 1);
    assert_eq!(m.n_total, 10);
    assert_eq!(m.n_scored, 9);
}

#[tokio::test]
async fn parse_and_transport_failures_are_distinguished() {
    let env = setup(&[("A", "cme", Some(true)), ("B", "cme", Some(true))]).await;
    let (classifier, _) = ScriptedClassifier::new(|text| {
        if text.starts_with("A/") {
            Ok("I am unable to help with that.".to_string())
        } else {
            Err(ClassifierError::Request("connection reset".to_string()))
        }
    });

    let summary = env.engine(Box::new(classifier)).start_run().await.unwrap();
    let counts = results::count_results(&env.pool, &summary.run_id).await.unwrap();
    assert_eq!(counts.errored, 2);
    assert_eq!(counts.parse_errors, 1);
    assert_eq!(counts.transport_errors, 1);

    let parse_row = results::get_result(&env.pool, &summary.run_id, "A", "cme")
        .await
        .unwrap()
        .unwrap();
    assert!(parse_row
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("parse failure:"));
    assert_eq!(
        parse_row.raw_response.as_deref(),
        Some("I am unable to help with that.")
    );

    // No scorable rows: every rate is undefined rather than NaN.
    let m = summary.metrics.unwrap();
    assert_eq!(m.accuracy, None);
    assert_eq!(m.precision, None);
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_metrics() {
    // Uninterrupted baseline.
    let baseline_env = setup_ten().await;
    let baseline = baseline_env
        .engine(Box::new(ScriptedClassifier::new(even_entities).0))
        .start_run()
        .await
        .unwrap();
    let baseline_metrics = baseline.metrics.unwrap();

    // Same corpus, killed after 4 items, then resumed.
    let env = setup_ten().await;
    let (first, first_calls) = ScriptedClassifier::new(even_entities);
    let run = env.engine(always_true()).create_run().await.unwrap();
    process_first(&env, &run.run_id, 4, &first).await.unwrap();
    assert_eq!(first_calls.load(Ordering::SeqCst), 4);

    let (second, second_calls) = ScriptedClassifier::new(even_entities);
    let summary = env
        .engine(Box::new(second))
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();

    assert_eq!(second_calls.load(Ordering::SeqCst), 6);
    assert_eq!(summary.attempted, 6);

    let rows = results::list_results(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(rows.len(), 10);
    let mut keys: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r.entity_id.clone(), r.subtype.clone()))
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 10);

    assert_eq!(summary.metrics.unwrap(), baseline_metrics);
    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.items_processed, 10);
    assert!(!lock_path(&env.lock_dir(), &run.run_id).exists());
}

#[tokio::test]
async fn duplicate_key_is_rejected() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();
    let (classifier, _) = ScriptedClassifier::new(|_| verdict(true));
    process_first(&env, &run.run_id, 1, &classifier).await.unwrap();

    let record = corpus::get_record(&env.pool, "A", "cme").await.unwrap().unwrap();
    for mode in [WriteMode::Insert, WriteMode::SupersedeErrored] {
        let err = processor::process_item(
            &env.pool,
            &classifier,
            &JsonVerdictParser,
            &run,
            &record,
            mode,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            engine_error(&err),
            EngineError::DuplicateResult { .. }
        ));
    }

    let counts = results::count_results(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(counts.total, 1);
}

#[tokio::test]
async fn metrics_are_pure() {
    let env = setup_ten().await;
    let summary = env
        .engine(Box::new(ScriptedClassifier::new(even_entities).0))
        .start_run()
        .await
        .unwrap();

    let first = metrics::compute(&env.pool, &summary.run_id).await.unwrap();
    let second = metrics::compute(&env.pool, &summary.run_id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(Some(first), summary.metrics);
}

#[tokio::test]
async fn no_positive_verdicts_gives_null_precision() {
    let env = setup(&[("A", "cme", Some(true)), ("B", "cme", Some(false))]).await;
    let (classifier, _) = ScriptedClassifier::new(|_| verdict(false));
    let m = env
        .engine(Box::new(classifier))
        .start_run()
        .await
        .unwrap()
        .metrics
        .unwrap();

    assert_eq!(m.n_true_positive + m.n_false_positive, 0);
    assert_eq!(m.precision, None);
    assert_eq!(m.recall, Some(0.0));
    assert_eq!(m.f1, None);
    assert_eq!(m.accuracy, Some(0.5));
}

#[tokio::test]
async fn retry_errors_only_reprocesses_exactly_errored_rows() {
    let env = setup_ten().await;
    let run = env.engine(always_true()).create_run().await.unwrap();

    let (first, _) = ScriptedClassifier::new(|text| {
        if text.starts_with("E3/") || text.starts_with("E7/") {
            Err(ClassifierError::Request("timeout".to_string()))
        } else {
            Ok(r#"{"detected": false, "rationale": "first pass"}"#.to_string())
        }
    });
    process_first(&env, &run.run_id, 10, &first).await.unwrap();
    assert_eq!(
        results::count_results(&env.pool, &run.run_id).await.unwrap().errored,
        2
    );

    let (second, calls) = ScriptedClassifier::new(|_| {
        Ok(r#"{"detected": true, "rationale": "retry pass"}"#.to_string())
    });
    let summary = env
        .engine(Box::new(second))
        .resume_run(&run.run_id, WorkMode::RetryErrorsOnly)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.attempted, 2);
    assert!(summary.finalized());

    let rows = results::list_results(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(rows.len(), 10);
    for row in &rows {
        assert!(!row.error_occurred);
        let expected = if row.entity_id == "E3" || row.entity_id == "E7" {
            "retry pass"
        } else {
            "first pass"
        };
        assert_eq!(row.rationale.as_deref(), Some(expected), "{}", row.entity_id);
    }
}

#[tokio::test]
async fn retry_pass_leaves_unattempted_items_open() {
    let env = setup_ten().await;
    let run = env.engine(always_true()).create_run().await.unwrap();
    let (failing, _) =
        ScriptedClassifier::new(|_| Err(ClassifierError::Request("down".to_string())));
    process_first(&env, &run.run_id, 3, &failing).await.unwrap();

    let summary = env
        .engine(always_true())
        .resume_run(&run.run_id, WorkMode::RetryErrorsOnly)
        .await
        .unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.remaining, 7);
    assert!(!summary.finalized());

    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Running);

    // A normal resume then finishes the job.
    let summary = env
        .engine(always_true())
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();
    assert_eq!(summary.attempted, 7);
    assert!(summary.finalized());
}

#[tokio::test]
async fn resume_with_nothing_left_just_finalizes() {
    let env = setup(&[("A", "cme", Some(true)), ("B", "le", None)]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();
    let (classifier, _) = ScriptedClassifier::new(|_| verdict(true));
    process_first(&env, &run.run_id, 2, &classifier).await.unwrap();

    let (unused, calls) = ScriptedClassifier::new(|_| verdict(false));
    let summary = env
        .engine(Box::new(unused))
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.attempted, 0);
    let m = summary.metrics.unwrap();
    assert_eq!(m.n_true_positive, 1);
    assert_eq!(m.n_scored, 1);
    assert_eq!(m.n_total, 2);
}

#[tokio::test]
async fn completed_run_cannot_be_resumed() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let engine = env.engine(always_true());
    let summary = engine.start_run().await.unwrap();
    let before = registry::require_run(&env.pool, &summary.run_id).await.unwrap();

    for mode in [WorkMode::Normal, WorkMode::RetryErrorsOnly] {
        let err = engine.resume_run(&summary.run_id, mode).await.unwrap_err();
        assert!(matches!(engine_error(&err), EngineError::RunCompleted(_)));
    }
    let err = engine.finalize_run(&summary.run_id).await.unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::RunCompleted(_)));

    let after = registry::require_run(&env.pool, &summary.run_id).await.unwrap();
    assert_eq!(after.ended_at, before.ended_at);
    assert_eq!(after.metrics, before.metrics);
}

#[tokio::test]
async fn unknown_run_is_reported() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let err = env
        .engine(always_true())
        .resume_run("no-such-run", WorkMode::Normal)
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::RunNotFound(_)));
}

#[tokio::test]
async fn live_lock_blocks_resume() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();

    std::fs::create_dir_all(env.lock_dir()).unwrap();
    let path = lock_path(&env.lock_dir(), &run.run_id);
    let holder = LockInfo {
        pid: std::process::id(),
        run_id: run.run_id.clone(),
        acquired_at: 0,
    };
    std::fs::write(&path, serde_json::to_string(&holder).unwrap()).unwrap();

    let (classifier, calls) = ScriptedClassifier::new(|_| verdict(true));
    let err = env
        .engine(Box::new(classifier))
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::Locked { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(path.exists(), "live holder's lock must be left alone");

    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Running);
}

#[tokio::test]
async fn stale_lock_is_cleared_and_resume_proceeds() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();

    std::fs::create_dir_all(env.lock_dir()).unwrap();
    let path = lock_path(&env.lock_dir(), &run.run_id);
    let holder = LockInfo {
        pid: 999_999_999,
        run_id: run.run_id.clone(),
        acquired_at: 0,
    };
    std::fs::write(&path, serde_json::to_string(&holder).unwrap()).unwrap();

    let summary = env
        .engine(always_true())
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();
    assert!(summary.finalized());
    assert!(!path.exists());
}

#[tokio::test]
async fn corpus_change_blocks_resume() {
    let env = setup(&[("A", "cme", Some(true)), ("B", "cme", Some(false))]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();
    let (classifier, _) = ScriptedClassifier::new(|_| verdict(true));
    process_first(&env, &run.run_id, 1, &classifier).await.unwrap();

    sqlx::query("UPDATE corpus SET text = 'edited' WHERE entity_id = 'B'")
        .execute(&env.pool)
        .await
        .unwrap();

    let (classifier, calls) = ScriptedClassifier::new(|_| verdict(true));
    let err = env
        .engine(Box::new(classifier))
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::Integrity { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Left in its prior state, lock released.
    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Running);
    assert_eq!(stored.notes, None);
    assert!(!lock_path(&env.lock_dir(), &run.run_id).exists());
}

#[tokio::test]
async fn legacy_run_without_checksum_resumes() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let run = env.engine(always_true()).create_run().await.unwrap();
    sqlx::query("UPDATE runs SET corpus_checksum = NULL WHERE run_id = ?")
        .bind(&run.run_id)
        .execute(&env.pool)
        .await
        .unwrap();

    let summary = env
        .engine(always_true())
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();
    assert!(summary.finalized());
}

/// Installs a trigger rejecting result inserts on its `fail_on`-th call, so
/// the following write hits an unrecoverable store error.
struct SabotagingClassifier {
    pool: SqlitePool,
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl Classifier for SabotagingClassifier {
    fn name(&self) -> &str {
        "sabotage"
    }

    async fn classify(&self, _request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            sqlx::query(
                "CREATE TRIGGER block_results BEFORE INSERT ON results \
                 BEGIN SELECT RAISE(ABORT, 'results store unavailable'); END",
            )
                .execute(&self.pool)
                .await
                .map_err(|e| ClassifierError::Request(e.to_string()))?;
        }
        verdict(true)
    }
}

#[tokio::test]
async fn store_failure_marks_run_failed_and_failed_run_resumes() {
    let env = setup_ten().await;
    let classifier = SabotagingClassifier {
        pool: env.pool.clone(),
        calls: AtomicUsize::new(0),
        fail_on: 3,
    };

    let engine = env.engine(Box::new(classifier));
    let run = engine.create_run().await.unwrap();
    let err = engine.process_new_run(run.clone()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("results store unavailable"));

    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.ended_at.is_some());
    assert!(stored
        .notes
        .as_deref()
        .unwrap_or_default()
        .contains("results store unavailable"));

    // Operator fixes the store; the partial log is intact and resumable.
    sqlx::query("DROP TRIGGER block_results")
        .execute(&env.pool)
        .await
        .unwrap();
    assert_eq!(
        results::count_results(&env.pool, &run.run_id).await.unwrap().total,
        2
    );

    let (classifier, calls) = ScriptedClassifier::new(|_| verdict(true));
    let summary = env
        .engine(Box::new(classifier))
        .resume_run(&run.run_id, WorkMode::Normal)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert!(summary.finalized());

    let stored = registry::require_run(&env.pool, &run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.notes, None);
    assert_eq!(stored.items_processed, 10);
}

#[tokio::test]
async fn unloaded_source_is_a_config_error() {
    let mut env = setup(&[("A", "cme", Some(true))]).await;
    if let Some(experiment) = env.config.experiment.as_mut() {
        experiment.source = "never-loaded".to_string();
    }

    let err = env.engine(always_true()).start_run().await.unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::Config(_)));

    let runs = registry::list_runs(&env.pool, 10).await.unwrap();
    assert!(runs.is_empty(), "nothing may be persisted on config errors");
}

#[tokio::test]
async fn mark_failed_never_raises() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let engine = env.engine(always_true());

    // Unknown run and an already-completed run: both only log.
    engine.mark_failed("missing", "boom").await;
    let summary = engine.start_run().await.unwrap();
    engine.mark_failed(&summary.run_id, "late failure").await;

    let stored = registry::require_run(&env.pool, &summary.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
}

#[tokio::test]
async fn corpus_is_immutable_after_load() {
    let env = setup(&[("A", "cme", Some(true))]).await;
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("more.jsonl");
    write_corpus(&path, &[("Z", "cme", None)]);

    let err = corpus::run_load(&env.pool, &path, "test-src").await.unwrap_err();
    assert!(err.to_string().contains("already loaded"));

    // Duplicate (entity_id, subtype) under a new source is rejected as a whole.
    write_corpus(&path, &[("Z", "cme", None), ("A", "cme", None)]);
    assert!(corpus::run_load(&env.pool, &path, "other").await.is_err());
    assert!(!corpus::is_loaded(&env.pool, "other").await.unwrap());
}
