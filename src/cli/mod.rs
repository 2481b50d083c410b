//! CLI subcommands: init, run, info, recipe listing, trust management,
//! processor listing, and the privileged services.

use crate::core::executor::{self, RunConfig};
use crate::core::index::{FileRecipeIndex, RecipeIndex};
use crate::core::prefs::{self, Preferences};
use crate::core::report::BatchReport;
use crate::core::resolver::{ResolveOptions, Resolver};
use crate::core::trust;
use crate::core::types::{RecipeChain, RunEvent, RunMode, RunStatus, Value};
use crate::daemon::auth::PeerCredAuthenticator;
use crate::daemon::installer::Installer;
use crate::daemon::packager::{FlatArchiveBuilder, Packager, PkgbuildBuilder};
use crate::daemon::{self, RequestHandler, Server, ServerConfig};
use crate::processors::{self, Processor, Registry};
use crate::provenance::eventlog;
use clap::{Args, Subcommand, ValueEnum};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Preferences file (default: <config dir>/pkgsmith/config.yaml)
    #[arg(long, global = true)]
    pub prefs: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalArgs {
    fn prefs_path(&self) -> PathBuf {
        self.prefs.clone().unwrap_or_else(prefs::default_path)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Packager,
    Installer,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Builder {
    /// Portable tar.gz package with an embedded manifest
    #[default]
    Flat,
    /// The platform `pkgbuild` tool
    Pkgbuild,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a template preferences file
    Init,

    /// Run one or more recipes
    Run {
        /// Recipe names, identifiers or paths
        recipes: Vec<String>,

        /// File listing recipes, one per line
        #[arg(long)]
        recipe_list: Option<PathBuf>,

        /// Set an input variable (KEY=VALUE), overriding recipe input
        #[arg(short = 'k', long = "key", value_name = "KEY=VALUE")]
        keys: Vec<String>,

        /// Stop at the end of the check phase
        #[arg(long)]
        check: bool,

        /// Write a JSON run report
        #[arg(long = "report-plist", value_name = "PATH")]
        report: Option<PathBuf>,

        /// Treat trust findings as fatal
        #[arg(long, conflicts_with = "ignore_trust")]
        strict_trust: bool,

        /// Only warn on trust findings, even if preferences say strict
        #[arg(long)]
        ignore_trust: bool,

        /// Processor to run before each recipe's steps (repeatable)
        #[arg(long = "pre", value_name = "PROCESSOR")]
        pre: Vec<String>,

        /// Processor to run after each recipe's steps (repeatable)
        #[arg(long = "post", value_name = "PROCESSOR")]
        post: Vec<String>,
    },

    /// Show a recipe's chain, input and steps
    Info {
        recipe: String,
    },

    /// List discovered recipes
    ListRecipes {
        /// Show identifiers and paths
        #[arg(long)]
        with_identifiers: bool,
    },

    /// Create an override for a recipe with current trust info
    MakeOverride {
        recipe: String,

        /// Directory to write to (default: first override directory)
        #[arg(long)]
        override_dir: Option<PathBuf>,

        /// Replace an existing override
        #[arg(long)]
        force: bool,
    },

    /// Recompute the trust info of overrides
    UpdateTrustInfo {
        #[arg(required = true)]
        overrides: Vec<String>,
    },

    /// Check overrides against their parents' current contents
    VerifyTrustInfo {
        #[arg(required = true)]
        overrides: Vec<String>,
    },

    /// List built-in processors
    ListProcessors,

    /// Describe a processor's inputs and outputs
    ProcessorInfo {
        name: String,

        /// Recipe whose directory provides recipe-adjacent processors
        #[arg(long)]
        recipe: Option<String>,
    },

    /// Run a privileged service
    Serve {
        #[arg(value_enum)]
        service: Service,

        /// Socket path (default: per-service path under /var/run/pkgsmith)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Exit after this many idle seconds (0 = never)
        #[arg(long, default_value_t = 10)]
        idle_timeout: u64,

        /// Parent directory for per-request build directories
        #[arg(long, default_value = daemon::DEFAULT_WORK_DIR)]
        work_dir: PathBuf,

        /// Largest accepted request in bytes
        #[arg(long, default_value_t = daemon::MAX_REQUEST_BYTES)]
        max_request_bytes: usize,

        /// Package builder used by the packager
        #[arg(long, value_enum, default_value_t = Builder::Flat)]
        builder: Builder,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands, global: &GlobalArgs) -> Result<(), String> {
    match cmd {
        Commands::Init => cmd_init(&global.prefs_path()),
        Commands::Run {
            recipes,
            recipe_list,
            keys,
            check,
            report,
            strict_trust,
            ignore_trust,
            pre,
            post,
        } => {
            let mut names = recipes;
            if let Some(ref list) = recipe_list {
                names.extend(read_recipe_list(list)?);
            }
            let opts = RunOptions {
                keys: parse_keys(&keys)?,
                mode: if check {
                    RunMode::CheckOnly
                } else {
                    RunMode::Full
                },
                report,
                strict_trust,
                ignore_trust,
                pre,
                post,
            };
            cmd_run(global, &names, &opts)
        }
        Commands::Info { recipe } => cmd_info(global, &recipe),
        Commands::ListRecipes { with_identifiers } => cmd_list_recipes(global, with_identifiers),
        Commands::MakeOverride {
            recipe,
            override_dir,
            force,
        } => cmd_make_override(global, &recipe, override_dir.as_deref(), force),
        Commands::UpdateTrustInfo { overrides } => cmd_update_trust_info(global, &overrides),
        Commands::VerifyTrustInfo { overrides } => cmd_verify_trust_info(global, &overrides),
        Commands::ListProcessors => cmd_list_processors(),
        Commands::ProcessorInfo { name, recipe } => {
            cmd_processor_info(global, &name, recipe.as_deref())
        }
        Commands::Serve {
            service,
            socket,
            idle_timeout,
            work_dir,
            max_request_bytes,
            builder,
        } => {
            let socket = socket.unwrap_or_else(|| {
                PathBuf::from(match service {
                    Service::Packager => daemon::DEFAULT_PACKAGER_SOCKET,
                    Service::Installer => daemon::DEFAULT_INSTALLER_SOCKET,
                })
            });
            let mut config = ServerConfig::new(&socket);
            config.idle_timeout = (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout));
            config.max_request_bytes = max_request_bytes;
            match (service, builder) {
                (Service::Packager, Builder::Flat) => {
                    serve(config, Packager::new(FlatArchiveBuilder, &work_dir))
                }
                (Service::Packager, Builder::Pkgbuild) => {
                    serve(config, Packager::new(PkgbuildBuilder, &work_dir))
                }
                (Service::Installer, _) => serve(config, Installer),
            }
        }
    }
}

/// Loaded preferences plus the recipe index they describe.
struct Workspace {
    prefs: Preferences,
    index: FileRecipeIndex,
}

impl Workspace {
    fn open(global: &GlobalArgs) -> Result<Self, String> {
        let prefs = Preferences::load(&global.prefs_path())?;
        let index = FileRecipeIndex::open(
            &prefs.cache_dir(),
            &prefs.search_dirs(),
            &prefs.override_dirs(),
        );
        Ok(Self { prefs, index })
    }

    fn resolve(&mut self, name: &str, strict_trust: bool) -> Result<RecipeChain, String> {
        let options = ResolveOptions {
            strict_trust,
            override_dirs: self.prefs.override_dirs(),
            ..ResolveOptions::default()
        };
        Resolver::new(&mut self.index, options)
            .resolve(name)
            .map_err(|e| e.to_string())
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    prefs::write_template(path)?;
    println!("Initialized pkgsmith preferences");
    println!("  Created: {}", path.display());
    Ok(())
}

/// Parse `KEY=VALUE` pairs. Values are kept as strings.
fn parse_keys(pairs: &[String]) -> Result<IndexMap<String, Value>, String> {
    let mut keys = IndexMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid -k '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("invalid -k '{}': empty key", pair));
        }
        keys.insert(key.to_string(), Value::from(value));
    }
    Ok(keys)
}

/// Recipe names from a list file; blank lines and `#` comments are skipped.
fn read_recipe_list(path: &Path) -> Result<Vec<String>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

struct RunOptions {
    keys: IndexMap<String, Value>,
    mode: RunMode,
    report: Option<PathBuf>,
    strict_trust: bool,
    ignore_trust: bool,
    pre: Vec<String>,
    post: Vec<String>,
}

fn cmd_run(global: &GlobalArgs, names: &[String], opts: &RunOptions) -> Result<(), String> {
    if names.is_empty() {
        return Err("no recipes given".to_string());
    }
    let mut ws = Workspace::open(global)?;
    let strict = (opts.strict_trust || ws.prefs.strict_trust) && !opts.ignore_trust;
    let registry = Registry::builtin();
    let cache_dir = ws.prefs.cache_dir();
    let pref_env = ws.prefs.to_env();
    let cfg = RunConfig {
        registry: &registry,
        cache_dir: &cache_dir,
        preferences: &pref_env,
        overrides: &opts.keys,
        mode: opts.mode,
        pre_processors: &opts.pre,
        post_processors: &opts.post,
        verbose: global.verbose,
        event_log: true,
    };

    let mut batch = BatchReport::new();
    for name in names {
        println!("Processing {}...", name);
        let chain = match ws.resolve(name, strict) {
            Ok(chain) => chain,
            Err(e) => {
                eprintln!("  ERROR: {}", e);
                batch.record_error(name, &e);
                continue;
            }
        };
        for finding in &chain.trust_findings {
            eprintln!("  WARNING: {}", finding);
        }
        let report = executor::run(&chain, &cfg);
        match report.status {
            RunStatus::Failed => {
                if let Some(ref f) = report.failure {
                    eprintln!("  FAILED: {}", f.message);
                    if let Some(ref trace) = f.trace {
                        for line in trace.lines() {
                            eprintln!("    {}", line);
                        }
                    }
                }
            }
            status => println!("  {} ({:.1}s)", status, report.duration_seconds),
        }
        batch.record_run(&report);
    }

    print_summary(&batch);
    if let Some(ref path) = opts.report {
        batch.write(path)?;
        println!("Report written to {}", path.display());
    }
    if batch.has_failures() {
        return Err(format!("{} recipe(s) failed", batch.failures.len()));
    }
    Ok(())
}

fn print_summary(batch: &BatchReport) {
    println!();
    for (key, table) in &batch.summary_results {
        println!("{}", table.summary_text.as_deref().unwrap_or(key));
        for row in &table.data_rows {
            match row.as_map() {
                Some(map) => {
                    let cells: Vec<String> = map
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    println!("  {}", cells.join("  "));
                }
                None => println!("  {}", row),
            }
        }
    }
    println!(
        "Run complete: {} completed, {} skipped, {} failed.",
        batch.completed.len(),
        batch.skipped.len(),
        batch.failures.len()
    );
}

fn cmd_info(global: &GlobalArgs, name: &str) -> Result<(), String> {
    let mut ws = Workspace::open(global)?;
    let chain = ws.resolve(name, false)?;
    let leaf = chain.leaf().ok_or("empty recipe chain")?;

    println!("Identifier:  {}", leaf.identifier);
    println!("Path:        {}", leaf.path.display());
    if let Some(ref description) = leaf.description {
        println!("Description: {}", description);
    }
    println!("Override:    {}", if leaf.is_override { "yes" } else { "no" });
    println!("Chain:");
    for (id, path) in chain.ordered_identifiers.iter().zip(&chain.ordered_paths) {
        println!("  {} ({})", id, path.display());
    }
    println!("Input:");
    for (key, value) in &chain.merged_input {
        println!("  {}: {}", key, value);
    }
    println!("Steps:");
    for (i, step) in chain.merged_steps.iter().enumerate() {
        match step.comment {
            Some(ref c) => println!("  {:>2}. {}  # {}", i, step.processor, c),
            None => println!("  {:>2}. {}", i, step.processor),
        }
    }
    let journal = eventlog::journal_path(&ws.prefs.cache_dir().join(&leaf.identifier));
    if let Some(last) = eventlog::last_run(&eventlog::read_journal(&journal)?) {
        println!(
            "Last run:    {} {} ({})",
            last.started.format("%Y-%m-%d %H:%M:%S UTC"),
            last.outcome.as_ref().map_or("interrupted", RunEvent::kind),
            last.run_id
        );
    }
    if leaf.is_override {
        if chain.trust_findings.is_empty() {
            println!("Trust:       verified");
        } else {
            println!("Trust:       {} finding(s)", chain.trust_findings.len());
            for f in &chain.trust_findings {
                println!("  {}", f);
            }
        }
    }
    Ok(())
}

fn cmd_list_recipes(global: &GlobalArgs, with_identifiers: bool) -> Result<(), String> {
    let mut ws = Workspace::open(global)?;
    ws.index.rebuild()?;
    let mut entries = ws.index.entries().to_vec();
    entries.sort_by(|a, b| a.shortname.cmp(&b.shortname));
    for entry in &entries {
        let marker = if entry.is_override { " (override)" } else { "" };
        if with_identifiers {
            println!(
                "{:<40} {:<50} {}{}",
                entry.shortname,
                entry.identifier,
                entry.path.display(),
                marker
            );
        } else {
            println!("{}{}", entry.shortname, marker);
        }
    }
    Ok(())
}

fn cmd_make_override(
    global: &GlobalArgs,
    name: &str,
    override_dir: Option<&Path>,
    force: bool,
) -> Result<(), String> {
    let mut ws = Workspace::open(global)?;
    let dir = match override_dir {
        Some(d) => d.to_path_buf(),
        None => ws
            .prefs
            .override_dirs()
            .into_iter()
            .next()
            .ok_or("no override directory configured")?,
    };
    let chain = ws.resolve(name, false)?;
    let path = trust::make_override(&chain, &dir, force)?;
    ws.index.rebuild()?;
    println!("Override created: {}", path.display());
    Ok(())
}

/// Resolve each name, insisting that it is an override.
fn resolve_overrides(
    ws: &mut Workspace,
    names: &[String],
) -> Result<Vec<(String, RecipeChain)>, String> {
    let mut chains = Vec::with_capacity(names.len());
    for name in names {
        let chain = ws.resolve(name, false)?;
        if !chain.leaf().is_some_and(|r| r.is_override) {
            return Err(format!("{} is not an override", name));
        }
        chains.push((name.clone(), chain));
    }
    Ok(chains)
}

fn cmd_update_trust_info(global: &GlobalArgs, names: &[String]) -> Result<(), String> {
    let mut ws = Workspace::open(global)?;
    for (name, chain) in resolve_overrides(&mut ws, names)? {
        if trust::update_trust_info(&chain)? {
            println!("Updated trust info for {}", name);
        } else {
            println!("Trust info for {} is current", name);
        }
    }
    Ok(())
}

fn cmd_verify_trust_info(global: &GlobalArgs, names: &[String]) -> Result<(), String> {
    let mut ws = Workspace::open(global)?;
    let mut total = 0;
    for (name, chain) in resolve_overrides(&mut ws, names)? {
        if chain.trust_findings.is_empty() {
            println!("{}: OK", name);
            continue;
        }
        println!("{}: FAILED", name);
        for f in &chain.trust_findings {
            println!("  {}", f);
            if let (Some(expected), Some(actual)) = (&f.expected_hash, &f.actual_hash) {
                println!("    Expected: {}", expected);
                println!("    Actual:   {}", actual);
            }
        }
        total += chain.trust_findings.len();
    }
    if total > 0 {
        return Err(format!("{} trust finding(s)", total));
    }
    Ok(())
}

fn cmd_list_processors() -> Result<(), String> {
    let registry = Registry::builtin();
    for name in registry.names() {
        if let Some(p) = registry.create(name) {
            println!("{:<20} {}", name, p.description());
        }
    }
    Ok(())
}

fn cmd_processor_info(global: &GlobalArgs, name: &str, recipe: Option<&str>) -> Result<(), String> {
    let registry = Registry::builtin();
    let processor: Box<dyn Processor> = match (registry.create(name), recipe) {
        (Some(p), _) => p,
        (None, Some(recipe)) => {
            let mut ws = Workspace::open(global)?;
            let chain = ws.resolve(recipe, false)?;
            registry
                .resolve(name, &chain)
                .map_err(|e| e.to_string())?
        }
        (None, None) => return Err(format!("unknown processor: {}", name)),
    };
    print_processor(processor.as_ref());
    Ok(())
}

fn print_processor(p: &dyn Processor) {
    println!("{}", p.name());
    println!("  {}", p.description());
    println!("Input variables:");
    for v in p.input_variables() {
        let detail = match (v.required, v.default) {
            (true, _) => "required".to_string(),
            (false, Some(d)) => format!("default: {:?}", d),
            (false, None) => "optional".to_string(),
        };
        println!("  {:<28} {} ({})", v.name, v.description, detail);
    }
    println!("Output variables:");
    for v in p.output_variables() {
        println!("  {:<28} {}", v.name, v.description);
    }
    if processors::is_core(p.name()) {
        println!("Built-in: yes");
    }
}

fn serve<H: RequestHandler>(config: ServerConfig, handler: H) -> Result<(), String> {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("not running as root; ownership changes will fail");
    }
    let mut server =
        Server::bind(config, handler, PeerCredAuthenticator).map_err(|e| e.to_string())?;
    server.serve().map_err(|e| e.to_string())?;
    if server.timed_out() {
        tracing::info!("idle timeout reached");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::tests::Fixture;

    fn global(fx: &Fixture) -> GlobalArgs {
        let prefs = fx.tmp.path().join("config.yaml");
        std::fs::write(
            &prefs,
            format!(
                "RECIPE_SEARCH_DIRS: [{}]\nRECIPE_OVERRIDE_DIRS: [{}]\nCACHE_DIR: {}\n",
                fx.recipes.display(),
                fx.overrides.display(),
                fx.cache.display()
            ),
        )
        .unwrap();
        GlobalArgs {
            prefs: Some(prefs),
            verbose: 0,
        }
    }

    fn run_opts(report: Option<PathBuf>) -> RunOptions {
        RunOptions {
            keys: IndexMap::new(),
            mode: RunMode::Full,
            report,
            strict_trust: false,
            ignore_trust: false,
            pre: Vec::new(),
            post: Vec::new(),
        }
    }

    #[test]
    fn test_init_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkgsmith/config.yaml");
        cmd_init(&path).unwrap();
        assert!(path.exists());
        assert!(cmd_init(&path).is_err());
    }

    #[test]
    fn test_parse_keys() {
        let keys = parse_keys(&["NAME=Foo".to_string(), "URL=a=b".to_string()]).unwrap();
        assert_eq!(keys["NAME"], Value::from("Foo"));
        assert_eq!(keys["URL"], Value::from("a=b"));
        assert!(parse_keys(&["novalue".to_string()]).is_err());
        assert!(parse_keys(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_read_recipe_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "# nightly\nFoo.pkg\n\n  Bar.download  \n").unwrap();
        assert_eq!(read_recipe_list(&path).unwrap(), vec!["Foo.pkg", "Bar.download"]);
    }

    #[test]
    fn test_run_writes_report() {
        let fx = Fixture::new();
        fx.standard();
        let g = global(&fx);
        let report = fx.tmp.path().join("report.json");
        cmd_run(&g, &["Foo.pkg".to_string()], &run_opts(Some(report.clone()))).unwrap();
        assert!(fx.cache.join("com.example.pkg.Foo/FooApp.txt").exists());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["completed"][0], "com.example.pkg.Foo");
    }

    #[test]
    fn test_info_after_run() {
        let fx = Fixture::new();
        fx.standard();
        let g = global(&fx);
        cmd_info(&g, "Foo.pkg").unwrap();
        cmd_run(&g, &["Foo.pkg".to_string()], &run_opts(None)).unwrap();
        let journal = eventlog::journal_path(&fx.cache.join("com.example.pkg.Foo"));
        let records = eventlog::read_journal(&journal).unwrap();
        let last = eventlog::last_run(&records).unwrap();
        assert_eq!(last.outcome.map(|e| e.kind()), Some("run_completed"));
        cmd_info(&g, "Foo.pkg").unwrap();
    }

    #[test]
    fn test_run_missing_recipe_fails_batch() {
        let fx = Fixture::new();
        fx.standard();
        let g = global(&fx);
        let names = vec!["Foo.pkg".to_string(), "Nope".to_string()];
        let err = cmd_run(&g, &names, &run_opts(None)).unwrap_err();
        assert_eq!(err, "1 recipe(s) failed");
    }

    #[test]
    fn test_make_verify_update_override() {
        let fx = Fixture::new();
        fx.standard();
        let g = global(&fx);
        cmd_make_override(&g, "Foo.pkg", None, false).unwrap();
        assert!(fx.overrides.join("Foo.pkg.recipe.yaml").exists());
        cmd_verify_trust_info(&g, &["Foo.pkg".to_string()]).unwrap();

        fx.recipe(
            "Foo.pkg.recipe.yaml",
            "Identifier: com.example.pkg.Foo\nParentRecipe: com.example.download.Foo\n\
             Process:\n  - Processor: EndOfCheckPhase\n",
        );
        assert!(cmd_verify_trust_info(&g, &["Foo.pkg".to_string()]).is_err());
        cmd_update_trust_info(&g, &["Foo.pkg".to_string()]).unwrap();
        cmd_verify_trust_info(&g, &["Foo.pkg".to_string()]).unwrap();
    }

    #[test]
    fn test_strict_trust_blocks_run() {
        let fx = Fixture::new();
        fx.standard();
        let g = global(&fx);
        cmd_make_override(&g, "Foo.pkg", None, false).unwrap();
        fx.recipe(
            "Foo.download.recipe.yaml",
            "Identifier: com.example.download.Foo\nProcess:\n  - Processor: EndOfCheckPhase\n",
        );
        let mut opts = run_opts(None);
        opts.strict_trust = true;
        assert!(cmd_run(&g, &["Foo.pkg".to_string()], &opts).is_err());
        assert!(!fx.cache.join("local.com.example.pkg.Foo").exists());
    }

    #[test]
    fn test_verify_rejects_plain_recipe() {
        let fx = Fixture::new();
        fx.standard();
        let g = global(&fx);
        let err = cmd_verify_trust_info(&g, &["Foo.download".to_string()]).unwrap_err();
        assert!(err.contains("not an override"));
    }

    #[test]
    fn test_processor_info() {
        let fx = Fixture::new();
        let g = global(&fx);
        cmd_processor_info(&g, "PkgCreator", None).unwrap();
        assert!(cmd_processor_info(&g, "Nope", None).is_err());
        cmd_list_processors().unwrap();
    }
}
