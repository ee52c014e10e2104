use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use poolshift::application::Application;
use poolshift::branch::ConfigRepoBranch;
use poolshift::config::Config;
use poolshift::environment::SubsetVersion;
use poolshift::git::{ConfigRepo, SharedRepo};
use poolshift::health::{HealthcheckManager, TestPoolStateChecker};
use poolshift::k8s::KubectlClient;
use poolshift::log::Logger;
use poolshift::pool::PoolManager;
use poolshift::render::RepoRenderer;
use poolshift::status::StatusManager;
use poolshift::util::ProcessLock;
use poolshift::{plog, plog_debug, rollout, Context, Error, Result};

/// poolshift - blue/green pool orchestration backed by a git config repository
#[derive(Parser, Debug)]
#[command(name = "poolshift")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    POOLSHIFT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.poolshift/poolshift.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Configuration file (default ~/.poolshift/poolshift.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Exchange the prod and test pools
    Swap,

    /// Swap, requiring prod to be older than or equal to test
    RollForward,

    /// Swap, requiring prod to be newer than or equal to test
    RollBack,

    /// Re-apply the test-pool flags and routing implied by the current pools
    Align,

    /// Bind the test pool to an existing subset
    Promote {
        /// Subset version, e.g. v4
        #[arg(value_parser = parse_version)]
        version: SubsetVersion,
    },

    /// Wait for the queued rollout and de-queue each finished entry
    WaitRollout,

    /// Carry a config branch forward (fast-forward only)
    Dovetail {
        /// Subset version whose branch to advance; the root branch when omitted
        #[arg(value_parser = parse_version)]
        version: Option<SubsetVersion>,

        /// Branch or commit to merge forward from
        #[arg(long)]
        source: Option<String>,
    },

    /// Delete a subset's config branch locally and remotely and recreate it
    Rebuild {
        #[arg(value_parser = parse_version)]
        version: SubsetVersion,
    },

    /// Set image tags on a subset's config branch
    Tag {
        #[arg(value_parser = parse_version)]
        version: SubsetVersion,

        /// service=tag pairs
        #[arg(required = true, value_parser = parse_assignment)]
        tags: Vec<(String, String)>,
    },

    /// Scale an idle subset's deployments to zero
    SpinDown {
        #[arg(value_parser = parse_version)]
        version: SubsetVersion,
    },

    /// Restore an idle subset's deployments to their recorded size
    SpinUp {
        #[arg(value_parser = parse_version)]
        version: SubsetVersion,
    },

    /// Delete subset branches the environment no longer references
    Prune,

    /// Show pool bindings and, with --probe, the fleet's test-pool flags
    Status {
        #[arg(long)]
        probe: bool,
    },
}

fn parse_version(s: &str) -> std::result::Result<SubsetVersion, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(format!("expected service=tag, got '{}'", s)),
    }
}

/// Everything a command needs, wired once per invocation.
struct Engine {
    ctx: Context,
    app: Arc<Application>,
    health: Arc<HealthcheckManager>,
    kubectl: Arc<KubectlClient>,
}

impl Engine {
    fn new(ctx: Context) -> Result<Self> {
        let kubectl = Arc::new(KubectlClient::new(&ctx)?);
        let repo = SharedRepo::new(ConfigRepo::open(&ctx, &ctx.config.repo_path()?)?);
        let renderer = Arc::new(RepoRenderer::new(repo.clone(), ctx.config.repo.root_branch.clone()));
        let app = Arc::new(Application::new(ctx.clone(), repo, kubectl.clone(), renderer));
        let health = Arc::new(HealthcheckManager::new(&ctx, kubectl.clone(), kubectl.clone()));
        Ok(Self {
            ctx,
            app,
            health,
            kubectl,
        })
    }

    fn pools(&self) -> PoolManager {
        PoolManager::new(&self.ctx, self.app.clone(), self.health.clone())
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Swap => report_swap(self.pools().swap().await?),
            Command::RollForward => report_swap(self.pools().roll_forward().await?),
            Command::RollBack => report_swap(self.pools().roll_back().await?),
            Command::Align => self.pools().align().await?,
            Command::Promote { version } => self.pools().promote(version).await?,
            Command::WaitRollout => {
                let status = StatusManager::new(&self.ctx, self.kubectl.clone());
                let done = rollout::await_rollout(self.app.clone(), &status).await?;
                for target in done {
                    println!("{}  healthy", target);
                }
            }
            Command::Dovetail { version, source } => {
                let branch = self.branch(version).await?;
                let steps = self
                    .app
                    .repo()
                    .with(move |repo| branch.dovetail(repo, source.as_deref()))
                    .await?;
                if steps.is_empty() {
                    println!("Nothing to dovetail");
                }
                for step in steps {
                    println!("{}  {:?}", step.branch, step.outcome);
                }
            }
            Command::Rebuild { version } => {
                let branch = self.branch(Some(version)).await?;
                let name = branch.name.clone();
                self.app.repo().with(move |repo| branch.rebuild(repo)).await?;
                println!("Rebuilt {}", name);
            }
            Command::Tag { version, tags } => {
                let branch = self.branch(Some(version)).await?;
                let tags: BTreeMap<String, String> = tags.into_iter().collect();
                let commit = self
                    .app
                    .repo()
                    .with(move |repo| {
                        branch.establish(repo)?;
                        branch.write_image_tags(repo, &tags)
                    })
                    .await?;
                match commit {
                    Some(oid) => println!("Committed {:.7}", oid),
                    None => println!("Image tags already up to date"),
                }
            }
            Command::SpinDown { version } => {
                let scaled = self.pools().spin_down(version).await?;
                println!("Spun down {} deployment(s) of {}", scaled.len(), version);
            }
            Command::SpinUp { version } => {
                let scaled = self.pools().spin_up(version).await?;
                println!("Spun up {} deployment(s) of {}", scaled.len(), version);
            }
            Command::Prune => {
                for name in self.app.prune_branches().await? {
                    println!("Deleted {}", name);
                }
            }
            Command::Status { probe } => self.status(probe).await?,
        }
        Ok(())
    }

    async fn branch(&self, version: Option<SubsetVersion>) -> Result<ConfigRepoBranch> {
        match version {
            Some(version) => {
                let env = self.app.load_environment().await?;
                self.app.subset_branch(&env, version)
            }
            None => Ok(self.app.root_branch()),
        }
    }

    async fn status(&self, probe: bool) -> Result<()> {
        let env = self.app.load_environment().await?;
        println!("prod: {}", env.pools.prod);
        println!("test: {}", env.pools.test);
        println!();
        println!("Subsets:");
        for version in env.subsets.keys() {
            let branch = self.app.subset_branch(&env, *version)?;
            let pools: Vec<String> = env.pools_for(*version).iter().map(|p| p.to_string()).collect();
            println!("  {:<6} {:<24} {}", version.to_string(), branch.name, pools.join(","));
        }
        if let Some(rollout) = env.rollout.as_ref().filter(|r| !r.is_empty()) {
            println!();
            println!("Queued rollout:");
            for target in rollout.targets() {
                println!("  {}", target);
            }
        }
        if probe {
            let checker = TestPoolStateChecker::new(&self.ctx, self.health.clone());
            let services = self.app.flagged_services(&env).await?;
            println!();
            for (version, expected) in [(env.pools.prod, false), (env.pools.test, true)] {
                let verdict = checker.verdict(version, &services, expected).await;
                println!(
                    "{} (testPool={}): {}",
                    version,
                    expected,
                    if verdict.all_correct { "in agreement" } else { "NOT in agreement" }
                );
                for service in verdict.services.values() {
                    println!(
                        "  {:<20} {} ready pod(s) {}",
                        service.service,
                        service.readings.len(),
                        if service.correct { "ok" } else { "incorrect" }
                    );
                }
            }
        }
        Ok(())
    }
}

fn report_swap(report: poolshift::pool::SwapReport) {
    println!("prod: {}", report.prod);
    println!("test: {}", report.test);
    if !report.descending_converged {
        println!("warning: {} has not confirmed its test-pool flag; run `poolshift align`", report.test);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let log = Logger::init(cli.debug);
    plog_debug!(log, "poolshift starting: {:?}", cli.command);
    let _lock = ProcessLock::acquire(&config.lock_path()?)?;
    let ctx = Context::new(config, log);
    let engine = Engine::new(ctx.clone())?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(engine.run(cli.command));
    if let Err(e) = &result {
        plog_debug!(ctx.log, "Command failed: {}", e);
    } else {
        plog!(ctx.log, "Command finished");
    }
    result
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Aggregate { succeeded, failures }) => {
            eprintln!(
                "error: {} of {} operations failed",
                failures.len(),
                failures.len() + succeeded.len()
            );
            for failure in failures {
                eprintln!("  - {}", failure);
            }
            for done in succeeded {
                eprintln!("  ok {}", done);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
