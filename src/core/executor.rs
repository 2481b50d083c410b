//! Pipeline executor: runs a resolved chain against one environment.
//!
//! seed env → for each step: substitute → merge → resolve → check inputs →
//! run → stop check. Every transition is appended to the run journal in the
//! recipe's cache directory.

use super::parser::check_identifier;
use super::substitute;
use super::types::*;
use crate::processors::flow::STOP_KEY;
use crate::processors::{self, Registry, END_OF_CHECK_PHASE};
use crate::provenance::eventlog::RunJournal;
use indexmap::IndexMap;
use std::path::Path;
use std::time::Instant;

pub const KEY_IDENTIFIER: &str = "RECIPE_IDENTIFIER";
pub const KEY_CACHE_DIR: &str = "RECIPE_CACHE_DIR";
pub const KEY_RECIPE_DIR: &str = "RECIPE_DIR";
pub const KEY_RECIPE_PATH: &str = "RECIPE_PATH";
pub const KEY_PARENT_RECIPES: &str = "PARENT_RECIPES";
pub const KEY_VERSION: &str = "PKGSMITH_VERSION";
pub const KEY_VERBOSE: &str = "verbose";

/// Environment keys ending in this are collected into the run report.
pub const SUMMARY_SUFFIX: &str = "_summary_result";

/// Configuration for a pipeline run.
pub struct RunConfig<'a> {
    pub registry: &'a Registry,
    /// Base cache directory; each recipe gets `<cache_dir>/<identifier>`.
    pub cache_dir: &'a Path,
    /// Lowest-precedence values (preferences).
    pub preferences: &'a IndexMap<String, Value>,
    /// `-k KEY=VALUE` values; override recipe input.
    pub overrides: &'a IndexMap<String, Value>,
    pub mode: RunMode,
    pub pre_processors: &'a [String],
    pub post_processors: &'a [String],
    pub verbose: u8,
    pub event_log: bool,
}

/// Build the starting environment for a chain.
///
/// Precedence, lowest first: preferences, merged recipe input, caller
/// overrides, then the well-known keys.
pub fn seed_environment(chain: &RecipeChain, cfg: &RunConfig) -> Environment {
    let mut env = Environment::new();
    env.merge(cfg.preferences);
    env.merge(&chain.merged_input);
    env.merge(cfg.overrides);

    let identifier = chain.identifier();
    env.insert(KEY_IDENTIFIER, identifier);
    env.insert(
        KEY_CACHE_DIR,
        cfg.cache_dir.join(identifier).display().to_string(),
    );
    if let Some(leaf) = chain.leaf() {
        env.insert(KEY_RECIPE_DIR, leaf.dir().display().to_string());
        env.insert(KEY_RECIPE_PATH, leaf.path.display().to_string());
    }
    let ancestors = chain.ordered_paths.len().saturating_sub(1);
    env.insert(
        KEY_PARENT_RECIPES,
        Value::List(
            chain.ordered_paths[..ancestors]
                .iter()
                .map(|p| Value::String(p.display().to_string()))
                .collect(),
        ),
    );
    env.insert(KEY_VERSION, env!("CARGO_PKG_VERSION"));
    env.insert(KEY_VERBOSE, i64::from(cfg.verbose));
    env
}

/// Steps in execution order: pre-processors, the chain's steps, post-processors.
pub fn pipeline_steps(chain: &RecipeChain, cfg: &RunConfig) -> Vec<ProcessorStep> {
    let pre = cfg.pre_processors.iter().map(|p| ProcessorStep::named(p));
    let post = cfg.post_processors.iter().map(|p| ProcessorStep::named(p));
    pre.chain(chain.merged_steps.iter().cloned())
        .chain(post)
        .collect()
}

/// Run a single step against the environment.
pub fn run_step(
    step: &ProcessorStep,
    chain: &RecipeChain,
    registry: &Registry,
    env: &mut Environment,
) -> Result<(), processors::ProcessorFailure> {
    let arguments = substitute::substitute_arguments(&step.arguments, env)?;
    env.merge(&arguments);
    let processor = registry.resolve(&step.processor, chain)?;
    processors::prepare_inputs(processor.as_ref(), env)?;
    processor.run(env)
}

/// Journal writer that logs, rather than propagates, write failures.
struct RunLog {
    journal: Option<RunJournal>,
}

impl RunLog {
    fn event(&mut self, event: RunEvent) {
        if let Some(ref mut journal) = self.journal {
            if let Err(e) = journal.record(event) {
                tracing::warn!("run journal: {}", e);
            }
        }
    }
}

fn failed_before_start(
    mut report: RunReport,
    env: Environment,
    message: String,
    start: Instant,
) -> RunReport {
    report.status = RunStatus::Failed;
    report.failure = Some(FailureRecord {
        step_index: None,
        processor: None,
        message,
        trace: None,
    });
    finish(report, env, start)
}

/// Execute a chain. Never returns an error; failures are in the report.
pub fn run(chain: &RecipeChain, cfg: &RunConfig) -> RunReport {
    let start = Instant::now();
    let identifier = chain.identifier().to_string();

    let mut report = RunReport {
        identifier: identifier.clone(),
        recipe_path: chain.ordered_paths.last().cloned().unwrap_or_default(),
        status: RunStatus::Pending,
        steps: Vec::new(),
        failure: None,
        summary_results: IndexMap::new(),
        trust_findings: chain.trust_findings.clone(),
        duration_seconds: 0.0,
        env: Environment::new(),
    };
    // The identifier names the cache directory; nothing is written for a bad one.
    if let Err(e) = check_identifier(&identifier) {
        return failed_before_start(report, Environment::new(), e, start);
    }

    let mut env = seed_environment(chain, cfg);
    let recipe_cache = cfg.cache_dir.join(&identifier);
    if let Err(e) = std::fs::create_dir_all(&recipe_cache) {
        let message = format!("cannot create {}: {}", recipe_cache.display(), e);
        return failed_before_start(report, env, message, start);
    }
    let mut log = RunLog {
        journal: cfg.event_log.then(|| RunJournal::begin(&recipe_cache)),
    };

    let steps = pipeline_steps(chain, cfg);
    log.event(RunEvent::RunStarted {
        recipe: identifier.clone(),
        recipe_path: report.recipe_path.clone(),
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        check_only: cfg.mode == RunMode::CheckOnly,
        steps: steps.len(),
    });
    for finding in &chain.trust_findings {
        tracing::warn!("trust: {}", finding);
        log.event(RunEvent::TrustFinding {
            subject: finding.subject.clone(),
            detail: finding.to_string(),
        });
    }

    report.status = RunStatus::Running;
    tracing::info!("running {} ({} steps)", identifier, steps.len());

    for (index, step) in steps.iter().enumerate() {
        if cfg.mode == RunMode::CheckOnly && step.processor == END_OF_CHECK_PHASE {
            tracing::info!("{}: check phase complete", identifier);
            break;
        }

        tracing::info!("{}: step {} {}", identifier, index, step.processor);
        log.event(RunEvent::StepStarted {
            index,
            processor: step.processor.clone(),
        });
        let step_start = Instant::now();

        if let Err(failure) = run_step(step, chain, cfg.registry, &mut env) {
            tracing::error!("{}: {} failed: {}", identifier, step.processor, failure);
            log.event(RunEvent::StepFailed {
                index,
                processor: step.processor.clone(),
                error: failure.message.clone(),
            });
            log.event(RunEvent::RunFailed {
                error: failure.message.clone(),
            });
            report.status = RunStatus::Failed;
            report.failure = Some(FailureRecord {
                step_index: Some(index),
                processor: Some(step.processor.clone()),
                message: failure.message,
                trace: failure.detail,
            });
            return finish(report, env, start);
        }

        let duration = step_start.elapsed().as_secs_f64();
        report.steps.push(StepRecord {
            index,
            processor: step.processor.clone(),
            duration_seconds: duration,
        });
        log.event(RunEvent::StepCompleted {
            index,
            processor: step.processor.clone(),
            duration_seconds: duration,
        });

        if env.is_truthy(STOP_KEY) {
            tracing::info!("{}: stopped after {}", identifier, step.processor);
            log.event(RunEvent::RunSkipped {
                after_step: index,
            });
            report.status = RunStatus::Skipped;
            return finish(report, env, start);
        }
    }

    report.status = RunStatus::Completed;
    log.event(RunEvent::RunCompleted {
        steps_run: report.steps.len(),
        total_seconds: start.elapsed().as_secs_f64(),
    });
    finish(report, env, start)
}

fn finish(mut report: RunReport, env: Environment, start: Instant) -> RunReport {
    report.summary_results = env
        .iter()
        .filter(|(k, _)| k.ends_with(SUMMARY_SUFFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    report.duration_seconds = start.elapsed().as_secs_f64();
    report.env = env;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::build_chain;
    use crate::provenance::eventlog::{journal_path, last_run, read_journal};
    use std::path::PathBuf;

    fn step(processor: &str, args: &[(&str, Value)]) -> ProcessorStep {
        let mut s = ProcessorStep::named(processor);
        for (k, v) in args {
            s.arguments.insert(k.to_string(), v.clone());
        }
        s
    }

    fn recipe(dir: &Path, id: &str, parent: Option<&str>, steps: Vec<ProcessorStep>) -> Recipe {
        let mut input = IndexMap::new();
        input.insert("NAME".to_string(), Value::from(id));
        Recipe {
            identifier: id.to_string(),
            shortname: id.rsplit('.').next().unwrap_or(id).to_string(),
            path: dir.join(format!("{}.recipe.yaml", id)),
            description: None,
            parent_identifier: parent.map(String::from),
            minimum_version: None,
            input,
            steps,
            content_hash: String::new(),
            is_override: false,
            trust_info: None,
        }
    }

    struct Harness {
        tmp: tempfile::TempDir,
        registry: Registry,
        prefs: IndexMap<String, Value>,
        overrides: IndexMap<String, Value>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tmp: tempfile::tempdir().unwrap(),
                registry: Registry::builtin(),
                prefs: IndexMap::new(),
                overrides: IndexMap::new(),
            }
        }

        fn out(&self, name: &str) -> String {
            self.tmp.path().join(name).display().to_string()
        }

        fn config<'a>(&'a self, mode: RunMode) -> RunConfig<'a> {
            RunConfig {
                registry: &self.registry,
                cache_dir: self.tmp.path(),
                preferences: &self.prefs,
                overrides: &self.overrides,
                mode,
                pre_processors: &[],
                post_processors: &[],
                verbose: 0,
                event_log: true,
            }
        }

        fn chain(&self, steps: Vec<ProcessorStep>) -> RecipeChain {
            build_chain(vec![recipe(self.tmp.path(), "com.example.Foo", None, steps)]).unwrap()
        }
    }

    #[test]
    fn test_seed_precedence() {
        let mut h = Harness::new();
        h.prefs.insert("NAME".to_string(), Value::from("from prefs"));
        h.prefs.insert("PACKAGER_SOCKET".to_string(), Value::from("/tmp/p.sock"));
        h.overrides.insert("EXTRA".to_string(), Value::from("cli"));
        let base_steps = vec![ProcessorStep::named("EndOfCheckPhase")];
        let root = recipe(h.tmp.path(), "com.example.Base", None, base_steps);
        let child = recipe(
            h.tmp.path(),
            "com.example.Child",
            Some("com.example.Base"),
            vec![],
        );
        let chain = build_chain(vec![root, child]).unwrap();

        let env = seed_environment(&chain, &h.config(RunMode::Full));
        assert_eq!(env.get_str("NAME"), Some("com.example.Child"));
        assert_eq!(env.get_str("PACKAGER_SOCKET"), Some("/tmp/p.sock"));
        assert_eq!(env.get_str("EXTRA"), Some("cli"));
        assert_eq!(env.get_str(KEY_IDENTIFIER), Some("com.example.Child"));
        assert_eq!(
            PathBuf::from(env.get_str(KEY_CACHE_DIR).unwrap()),
            h.tmp.path().join("com.example.Child")
        );
        let parents = env.get(KEY_PARENT_RECIPES).unwrap().as_list().unwrap();
        assert_eq!(parents.len(), 1);
        assert!(parents[0].as_str().unwrap().ends_with("com.example.Base.recipe.yaml"));
    }

    #[test]
    fn test_overrides_beat_recipe_input() {
        let mut h = Harness::new();
        h.overrides.insert("NAME".to_string(), Value::from("Bar"));
        let chain = h.chain(vec![ProcessorStep::named("EndOfCheckPhase")]);
        let env = seed_environment(&chain, &h.config(RunMode::Full));
        assert_eq!(env.get_str("NAME"), Some("Bar"));
    }

    #[test]
    fn test_run_completes_with_substitution() {
        let h = Harness::new();
        let target = h.out("out.txt");
        let chain = h.chain(vec![step(
            "FileCreator",
            &[
                ("file_path", Value::from(target.clone())),
                ("file_content", Value::from("name=%NAME%")),
            ],
        )]);
        let report = run(&chain, &h.config(RunMode::Full));
        assert_eq!(report.status, RunStatus::Completed, "{:?}", report.failure);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "name=com.example.Foo");
        assert_eq!(report.steps.len(), 1);
        assert!(h.tmp.path().join("com.example.Foo").is_dir());
    }

    #[test]
    fn test_unresolved_reference_fails_step() {
        let h = Harness::new();
        let chain = h.chain(vec![
            ProcessorStep::named("EndOfCheckPhase"),
            step("FileCreator", &[("file_path", Value::from("%NOPE%"))]),
        ]);
        let report = run(&chain, &h.config(RunMode::Full));
        assert_eq!(report.status, RunStatus::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.step_index, Some(1));
        assert_eq!(failure.processor.as_deref(), Some("FileCreator"));
        assert!(failure.message.contains("%NOPE%"));
        assert_eq!(report.steps.len(), 1);
    }

    #[test]
    fn test_stop_processing_marks_skipped() {
        let h = Harness::new();
        let never = h.out("never.txt");
        let chain = h.chain(vec![
            step("StopProcessingIf", &[("predicate", Value::from("NAME == com.example.Foo"))]),
            step("FileCreator", &[("file_path", Value::from(never.clone()))]),
        ]);
        let report = run(&chain, &h.config(RunMode::Full));
        assert_eq!(report.status, RunStatus::Skipped);
        assert!(report.failure.is_none());
        assert!(!Path::new(&never).exists());
    }

    #[test]
    fn test_check_only_stops_at_marker() {
        let h = Harness::new();
        let before = h.out("before.txt");
        let after = h.out("after.txt");
        let chain = h.chain(vec![
            step("FileCreator", &[("file_path", Value::from(before.clone()))]),
            ProcessorStep::named("EndOfCheckPhase"),
            step("FileCreator", &[("file_path", Value::from(after.clone()))]),
        ]);
        let report = run(&chain, &h.config(RunMode::CheckOnly));
        assert_eq!(report.status, RunStatus::Completed);
        assert!(Path::new(&before).exists());
        assert!(!Path::new(&after).exists());

        let report = run(&chain, &h.config(RunMode::Full));
        assert_eq!(report.status, RunStatus::Completed);
        assert!(Path::new(&after).exists());
    }

    #[test]
    fn test_missing_required_input_fails() {
        let h = Harness::new();
        let chain = h.chain(vec![ProcessorStep::named("FileCreator")]);
        let report = run(&chain, &h.config(RunMode::Full));
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.failure.unwrap().message.contains("file_path"));
    }

    #[test]
    fn test_pre_and_post_processors() {
        let h = Harness::new();
        let chain = h.chain(vec![ProcessorStep::named("EndOfCheckPhase")]);
        let pre = vec!["EndOfCheckPhase".to_string()];
        let post = vec!["NoSuchProcessor".to_string()];
        let mut cfg = h.config(RunMode::Full);
        cfg.pre_processors = &pre;
        cfg.post_processors = &post;
        assert_eq!(pipeline_steps(&chain, &cfg).len(), 3);
        let report = run(&chain, &cfg);
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.unwrap().step_index, Some(2));
    }

    #[test]
    fn test_summary_results_collected() {
        let mut h = Harness::new();
        let mut summary = IndexMap::new();
        summary.insert("summary_text".to_string(), Value::from("done"));
        h.overrides
            .insert("widget_summary_result".to_string(), Value::Map(summary));
        let chain = h.chain(vec![ProcessorStep::named("EndOfCheckPhase")]);
        let report = run(&chain, &h.config(RunMode::Full));
        assert_eq!(report.summary_results.len(), 1);
        assert!(report.summary_results.contains_key("widget_summary_result"));
    }

    #[test]
    fn test_run_journal_written() {
        let h = Harness::new();
        let chain = h.chain(vec![ProcessorStep::named("EndOfCheckPhase")]);
        run(&chain, &h.config(RunMode::Full));
        run(&chain, &h.config(RunMode::Full));

        let records = read_journal(&journal_path(&h.tmp.path().join("com.example.Foo"))).unwrap();
        let last = last_run(&records).unwrap();
        let kinds: Vec<&str> = records
            .iter()
            .filter(|r| r.run_id == last.run_id)
            .map(|r| r.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["run_started", "step_started", "step_completed", "run_completed"]
        );
        assert_eq!(records.len(), 8);
    }

    #[test]
    fn test_identifier_escaping_cache_dir_fails_without_writes() {
        let h = Harness::new();
        let inner = h.tmp.path().join("cache");
        std::fs::create_dir_all(&inner).unwrap();
        let mut cfg = h.config(RunMode::Full);
        cfg.cache_dir = &inner;
        let chain = build_chain(vec![recipe(
            h.tmp.path(),
            "../escaped",
            None,
            vec![ProcessorStep::named("EndOfCheckPhase")],
        )])
        .unwrap();
        let report = run(&chain, &cfg);
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.failure.unwrap().message.contains("not a plain name"));
        assert!(!h.tmp.path().join("escaped").exists());
        assert_eq!(std::fs::read_dir(&inner).unwrap().count(), 0);
    }

    #[test]
    fn test_report_serializes_without_env() {
        let h = Harness::new();
        let chain = h.chain(vec![ProcessorStep::named("EndOfCheckPhase")]);
        let report = run(&chain, &h.config(RunMode::Full));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("env").is_none());
    }
}
