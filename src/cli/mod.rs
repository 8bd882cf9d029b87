//! KL-060: CLI subcommands — eval, install, validate, check-plan, status, schema.

use crate::actions::BuiltinActions;
use crate::core::config::Settings;
use crate::core::error::KilnError;
use crate::core::executor::{validate_plan, PlanExecutor};
use crate::core::installer::Installer;
use crate::core::planner::{EvalDependencyHandler, GenerateOptions, PlanGenerator};
use crate::core::recipe::{DependencySpec, DirRecipeLoader};
use crate::core::state::StateStore;
use crate::core::types::{InstallationPlan, Platform};
use crate::core::version::VersionResolver;
use crate::core::{parser, platform};
use crate::fetch::cache::DownloadCache;
use crate::fetch::http::HttpDownloader;
use crate::providers::builtin_resolver;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Cross-platform tool installer — deterministic plans, checksum-verified execution"
)]
pub struct Cli {
    /// Log filter (e.g. `info`, `kiln=debug`)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Target platform overrides. Unset dimensions come from the host.
#[derive(Args, Debug, Clone, Default)]
pub struct PlatformArgs {
    /// Target OS (linux, darwin, ...)
    #[arg(long)]
    pub os: Option<String>,

    /// Target architecture (amd64, arm64, ...)
    #[arg(long)]
    pub arch: Option<String>,

    /// Target Linux family (debian, rhel, alpine, arch, suse)
    #[arg(long)]
    pub linux_family: Option<String>,

    /// Target C library (glibc, musl)
    #[arg(long)]
    pub libc: Option<String>,
}

impl PlatformArgs {
    /// Apply overrides on top of `host`. Changing the OS away from the host
    /// drops the host's Linux-only dimensions.
    pub fn target(&self, host: &Platform) -> Platform {
        let mut target = host.clone();
        if let Some(ref os) = self.os {
            if *os != host.os {
                target.linux_family = None;
                target.libc = None;
            }
            target.os = os.clone();
        }
        if let Some(ref arch) = self.arch {
            target.arch = arch.clone();
        }
        if let Some(ref family) = self.linux_family {
            target.linux_family = Some(family.clone());
        }
        if let Some(ref libc) = self.libc {
            target.libc = Some(libc.clone());
        }
        target
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a fresh installation plan without installing
    Eval {
        /// Tool, optionally pinned: `fzf` or `fzf@0.46.0`
        tool: String,

        /// Write the plan here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        platform: PlatformArgs,

        /// Install eval-time dependencies without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Install a tool on this host
    Install {
        /// Tool, optionally pinned: `fzf` or `fzf@0.46.0`
        tool: Option<String>,

        /// Ignore any cached plan and regenerate
        #[arg(long)]
        refresh: bool,

        /// Execute this plan file instead of generating one
        #[arg(long, conflicts_with_all = ["tool", "refresh"])]
        plan: Option<PathBuf>,

        /// Install eval-time dependencies without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Validate a recipe file
    Validate {
        /// Recipe file (.toml or .yaml)
        file: PathBuf,
    },

    /// Check that a plan file is executable on the (target) host
    CheckPlan {
        /// Plan JSON file
        file: PathBuf,

        #[command(flatten)]
        platform: PlatformArgs,
    },

    /// List installed tools
    Status,

    /// Print the JSON Schema of the plan format
    Schema,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), KilnError> {
    match cmd {
        Commands::Eval {
            tool,
            output,
            platform: target,
            yes,
        } => {
            let env = Env::load()?;
            cmd_eval(&env, &tool, output.as_deref(), &target, yes)
        }
        Commands::Install {
            tool,
            refresh,
            plan,
            yes,
        } => {
            let env = Env::load()?;
            match (plan, tool) {
                (Some(file), _) => cmd_install_plan(&env, &file),
                (None, Some(tool)) => cmd_install(&env, &tool, refresh, yes),
                (None, None) => Err(KilnError::Config(
                    "install needs a tool name or --plan FILE".into(),
                )),
            }
        }
        Commands::Validate { file } => cmd_validate(&file),
        Commands::CheckPlan {
            file,
            platform: target,
        } => cmd_check_plan(&file, &target.target(&platform::detect_host())),
        Commands::Status => {
            let settings = Settings::load()?;
            cmd_status(&StateStore::new(settings.state_dir))
        }
        Commands::Schema => {
            println!("{}", plan_schema()?);
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kiln", &mut std::io::stdout());
            Ok(())
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Production components, built once per invocation.
struct Env {
    loader: DirRecipeLoader,
    versions: VersionResolver,
    downloader: HttpDownloader,
    state: StateStore,
    host: Platform,
    tools_dir: PathBuf,
    work_dir: PathBuf,
}

impl Env {
    fn load() -> Result<Self, KilnError> {
        let settings = Settings::load()?;
        Ok(Self {
            loader: DirRecipeLoader::new(settings.recipes_dirs.clone()),
            versions: builtin_resolver(&settings.github_api_url, settings.http_timeout),
            downloader: HttpDownloader::new(
                DownloadCache::new(settings.cache_dir.clone()),
                settings.http_timeout,
            ),
            state: StateStore::new(settings.state_dir.clone()),
            host: platform::detect_host(),
            tools_dir: settings.tools_dir,
            work_dir: settings.work_dir,
        })
    }

    fn installer<'a>(&'a self, handler: Option<&'a dyn EvalDependencyHandler>) -> Installer<'a> {
        let mut generator =
            PlanGenerator::new(&self.loader, &self.versions, &self.downloader).with_store(&self.state);
        if let Some(handler) = handler {
            generator = generator.with_eval_handler(handler);
        }
        let executor = PlanExecutor::new(
            &BuiltinActions,
            &self.downloader,
            self.host.clone(),
            self.tools_dir.clone(),
            self.work_dir.clone(),
        )
        .with_state(&self.state);
        Installer::new(generator, executor, &self.state)
    }
}

/// Installs eval-time dependencies as ordinary kiln tools on this host.
struct HostEvalDependencies<'a> {
    env: &'a Env,
}

impl EvalDependencyHandler for HostEvalDependencies<'_> {
    fn missing(&self, deps: &[String]) -> Vec<String> {
        let installed = self.env.state.list_installed().unwrap_or_default();
        deps.iter()
            .filter(|d| !installed.iter().any(|(tool, _)| tool == *d))
            .cloned()
            .collect()
    }

    fn install(&self, deps: &[String], auto_accept: bool) -> Result<(), String> {
        if !auto_accept {
            return Err(format!(
                "generation needs {} on this host; rerun with --yes to install",
                deps.join(", ")
            ));
        }
        let installer = self.env.installer(None);
        for dep in deps {
            println!("Installing eval-time dependency {}", dep);
            installer
                .install(dep, "", &GenerateOptions::install(false))
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

fn parse_tool(spec: &str) -> Result<DependencySpec, KilnError> {
    DependencySpec::parse(spec)
        .ok_or_else(|| KilnError::Config(format!("invalid tool '{}': expected name[@version]", spec)))
}

fn read_plan(file: &Path) -> Result<InstallationPlan, KilnError> {
    let content = std::fs::read_to_string(file).map_err(|e| KilnError::io(file, e))?;
    InstallationPlan::from_json(&content).map_err(|source| KilnError::PlanFile {
        path: file.display().to_string(),
        source,
    })
}

fn plan_json(plan: &InstallationPlan) -> Result<String, KilnError> {
    Ok(plan.to_json_pretty()?)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_eval(
    env: &Env,
    spec: &str,
    output: Option<&Path>,
    target: &PlatformArgs,
    yes: bool,
) -> Result<(), KilnError> {
    let spec = parse_tool(spec)?;
    let handler = HostEvalDependencies { env };
    let platform = target.target(&env.host);
    let plan = env
        .installer(Some(&handler))
        .eval(&spec.name, &spec.constraint, &platform, yes)?;

    let json = plan_json(&plan)?;
    match output {
        Some(path) => {
            std::fs::write(path, json + "\n").map_err(|e| KilnError::io(path, e))?;
            println!(
                "Wrote plan for {} {} ({}) to {}",
                plan.tool,
                plan.version,
                plan.platform,
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn cmd_install(env: &Env, spec: &str, refresh: bool, yes: bool) -> Result<(), KilnError> {
    let spec = parse_tool(spec)?;
    let handler = HostEvalDependencies { env };
    let opts = GenerateOptions {
        auto_accept_eval_deps: yes,
        ..GenerateOptions::install(refresh)
    };
    let outcome = env
        .installer(Some(&handler))
        .install(&spec.name, &spec.constraint, &opts)?;
    print_outcome(&outcome.plan, &outcome.report);
    Ok(())
}

fn cmd_install_plan(env: &Env, file: &Path) -> Result<(), KilnError> {
    let plan = read_plan(file)?;
    let outcome = env.installer(None).install_plan(plan)?;
    print_outcome(&outcome.plan, &outcome.report);
    Ok(())
}

fn print_outcome(plan: &InstallationPlan, report: &crate::core::executor::ExecutionReport) {
    println!(
        "Installed {} {} ({} steps in {:.1}s)",
        plan.tool,
        plan.version,
        report.steps_run,
        report.duration.as_secs_f64()
    );
    for unit in &report.installed {
        println!("  {} {} -> {}", unit.tool, unit.version, unit.install_dir.display());
    }
    for skipped in &report.dependencies_skipped {
        println!("  {} (already installed)", skipped);
    }
}

fn cmd_validate(file: &Path) -> Result<(), KilnError> {
    let (recipe, errors) = parser::parse_recipe_file(file)?;
    if errors.is_empty() {
        println!(
            "OK: {} ({} steps, {} dependencies)",
            recipe.name(),
            recipe.steps.len(),
            recipe.metadata.dependencies.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(KilnError::Config(format!("{} validation error(s)", errors.len())))
    }
}

fn cmd_check_plan(file: &Path, target: &Platform) -> Result<(), KilnError> {
    let plan = read_plan(file)?;
    validate_plan(&plan, target, &BuiltinActions).map_err(|source| KilnError::PlanCheck {
        path: file.display().to_string(),
        source,
    })?;
    println!(
        "OK: {} {} for {} ({} steps, {} dependencies, {})",
        plan.tool,
        plan.version,
        plan.platform,
        plan.steps.len(),
        plan.dependencies.len(),
        plan.content_hash()
    );
    Ok(())
}

fn cmd_status(state: &StateStore) -> Result<(), KilnError> {
    let installed = state.list_installed()?;
    if installed.is_empty() {
        println!("No tools installed. Run `kiln install <tool>` first.");
        return Ok(());
    }
    for (tool, version) in installed {
        match state.load(&tool, &version)? {
            Some(s) => println!("{} {}  {}  {}", s.tool, s.version, s.installed_at, s.install_dir),
            None => println!("{} {}", tool, version),
        }
    }
    Ok(())
}

fn plan_schema() -> Result<String, KilnError> {
    let schema = schemars::schema_for!(InstallationPlan);
    Ok(serde_json::to_string_pretty(&schema)?)
}
