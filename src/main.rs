use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use svn_git_emit::changes::{self, ChangeReader, RevisionRange};
use svn_git_emit::config::{ImportOptions, RuleOptions, RulesConfig};
use svn_git_emit::registry::Registry;
use svn_git_emit::repository::Revnum;
use svn_git_emit::telemetry::{self, Verbosity};

#[derive(Parser, Debug)]
#[command(name = "svn-git-emit", version, about = "Write converted SVN history into git repositories")]
struct Args {
    /// Repository rules (YAML)
    #[arg(long)]
    rules: PathBuf,
    /// Change stream, one JSON revision per line
    #[arg(long)]
    changes: PathBuf,
    /// Where repositories and logs are written
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Write the import stream to the logs without running git
    #[arg(long)]
    dry_run: bool,
    /// Append `svn path=...; revision=...` to commit messages
    #[arg(long)]
    add_metadata: bool,
    /// Record the same metadata as git notes
    #[arg(long)]
    add_metadata_notes: bool,
    #[arg(long)]
    commit_interval: Option<u64>,
    /// Most importers kept running at once
    #[arg(long)]
    max_processes: Option<usize>,
    /// Continue from the logs of a previous run
    #[arg(long)]
    resume: bool,
    /// Resume at this revision, discarding anything imported after it
    #[arg(long, requires = "resume")]
    resume_from: Option<Revnum>,
    /// Stop after this revision
    #[arg(long)]
    max_rev: Option<Revnum>,
    /// Git executable (defaults to $SVN_GIT_EMIT_GIT, then `git`)
    #[arg(long)]
    git: Option<PathBuf>,
    #[arg(short, long, conflicts_with_all = ["verbose", "extra_verbose"])]
    quiet: bool,
    #[arg(short, long)]
    verbose: bool,
    #[arg(short = 'X', long)]
    extra_verbose: bool,
    /// Exit with 0 even when errors were logged
    #[arg(long)]
    exit_success: bool,
}

impl Args {
    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.extra_verbose {
            Verbosity::Trace
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn options(&self, rules: &RulesConfig) -> ImportOptions {
        let mut options = ImportOptions {
            dry_run: self.dry_run,
            incremental: self.resume,
            ..ImportOptions::default()
        };
        if let Some(git) = &self.git {
            options.git = git.clone();
        }
        let given = RuleOptions {
            output_dir: self.output_dir.clone(),
            commit_interval: self.commit_interval,
            max_processes: self.max_processes,
            add_metadata: self.add_metadata,
            add_metadata_notes: self.add_metadata_notes,
            ..RuleOptions::default()
        };
        given.or(&rules.options).apply_to(&mut options);
        options
    }
}

fn spinner(quiet: bool) -> Result<Option<ProgressBar>> {
    if quiet {
        return Ok(None);
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::default_spinner().template("{spinner} {msg} ({elapsed})")?);
    bar.enable_steady_tick(Duration::from_millis(120));
    Ok(Some(bar))
}

fn run(args: &Args) -> Result<()> {
    let rules = RulesConfig::load_from_file(&args.rules)
        .with_context(|| format!("loading rules from {}", args.rules.display()))?;
    let options = args.options(&rules);
    let mut registry = Registry::from_config(&rules, options).context("setting up repositories")?;

    let start = if args.resume {
        registry
            .setup_incremental(args.resume_from)
            .context("replaying previous run")?
    } else {
        1
    };

    let file = File::open(&args.changes)
        .with_context(|| format!("opening change stream {}", args.changes.display()))?;
    let range = RevisionRange {
        start,
        max: args.max_rev,
    };

    let bar = spinner(args.quiet)?;
    let records = ChangeReader::new(BufReader::new(file));
    let imported = changes::import(&mut registry, records, range, |revision| {
        if let Some(bar) = &bar {
            bar.set_message(format!("r{revision}"));
        }
    });
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    // importers are closed even when the import failed so the marks survive
    let finished = registry.finish().context("closing importers");
    let imported = imported.context("importing revisions")?;
    finished?;
    tracing::info!("imported {imported} revisions");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let counter = telemetry::init(args.verbosity());

    if let Err(e) = run(&args) {
        tracing::error!("{e:#}");
        return ExitCode::FAILURE;
    }
    if counter.errors() > 0 && !args.exit_success {
        return ExitCode::FAILURE;
    }
    if counter.warnings() > 0 {
        tracing::info!("{} warnings", counter.warnings());
    }
    ExitCode::SUCCESS
}
