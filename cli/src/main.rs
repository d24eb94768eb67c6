mod stages;

use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use console::style;
use nagare::{BypassDirective, Executor, LocalRunner, RunConfig, RunDirectory, Strategy};

use crate::stages::Subject;

/// Runs FreeSurfer recon-all, ANTs cortical thickness and mindboggle on a
/// single T1-weighted image.
#[derive(Parser, Debug, Clone)]
#[command(name = "nagare", version)]
struct Args {
    /// T1-weighted MRI image.
    data: Utf8PathBuf,

    /// Subject identifier, used to name output directories.
    #[arg(long)]
    id: String,

    /// Output directory, one subdirectory per stage.
    #[arg(long)]
    out: Utf8PathBuf,

    /// Working directory for intermediate files and the cache
    /// (defaults to OUT/working).
    #[arg(long)]
    working: Option<Utf8PathBuf>,

    /// OASIS-30 Atropos template directory.
    #[arg(long, default_value = "/opt/data/OASIS-30_Atropos_template")]
    template: Utf8PathBuf,

    /// Run one stage at a time.
    #[arg(long, conflicts_with = "workers")]
    serial: bool,

    /// Number of stages allowed to run at once.
    #[arg(long)]
    workers: Option<NonZeroUsize>,

    /// Reuse an existing FreeSurfer subject directory instead of running recon-all.
    #[arg(long, value_name = "DIR", conflicts_with = "skip_thickness")]
    skip_recon: Option<Utf8PathBuf>,

    /// Reuse an existing ANTs output directory instead of running
    /// antsCorticalThickness.sh.
    #[arg(long, value_name = "DIR")]
    skip_thickness: Option<Utf8PathBuf>,

    /// Always run every stage, neither reading nor filling the cache.
    #[arg(long)]
    no_cache: bool,

    /// TOML run configuration; flags take precedence.
    #[arg(long, value_name = "FILE")]
    config: Option<Utf8PathBuf>,

    /// Write the execution report as JSON.
    #[arg(long, value_name = "FILE")]
    report: Option<Utf8PathBuf>,

    /// Write a Mermaid diagram of the run.
    #[arg(long, value_name = "FILE")]
    diagram: Option<Utf8PathBuf>,

    /// Extra argument for recon-all, repeatable.
    #[arg(long = "fs-flag", value_name = "ARG", allow_hyphen_values = true)]
    fs_flags: Vec<String>,

    /// Extra argument for antsCorticalThickness.sh, repeatable.
    #[arg(long = "ants-flag", value_name = "ARG", allow_hyphen_values = true)]
    ants_flags: Vec<String>,

    /// Extra argument for mindboggle, repeatable.
    #[arg(long = "mb-flag", value_name = "ARG", allow_hyphen_values = true)]
    mb_flags: Vec<String>,
}

impl Args {
    /// Layers the flags over the configuration file, if any.
    fn run_config(&self, working: &Utf8Path) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => {
                RunConfig::load(path).with_context(|| format!("couldn't load config {path}"))?
            }
            None => RunConfig::default().with_strategy(Strategy::parallel()),
        };

        if self.serial {
            config.strategy = Strategy::Serial;
        }
        if let Some(workers) = self.workers {
            config.strategy = Strategy::Parallel(workers);
        }
        if self.no_cache {
            config.cache = false;
        }
        if config.cache_dir.is_none() {
            config.cache_dir = Some(working.join("cache"));
        }

        if let Some(dir) = &self.skip_recon {
            config.bypass.push(BypassDirective::new(
                stages::RECON,
                stages::recon_outputs(&absolute(dir)?),
            ));
        }
        if let Some(dir) = &self.skip_thickness {
            config.bypass.push(BypassDirective::new(
                stages::THICKNESS,
                stages::thickness_outputs(&absolute(dir)?),
            ));
        }

        Ok(config)
    }
}

fn absolute(path: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    path.canonicalize_utf8()
        .with_context(|| format!("couldn't resolve {path}"))
}

fn create_dir(path: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    std::fs::create_dir_all(path).with_context(|| format!("couldn't create {path}"))?;
    absolute(path)
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    nagare::init_logging()?;

    let out = create_dir(&args.out)?;
    let working = match &args.working {
        Some(dir) => create_dir(dir)?,
        None => create_dir(&out.join("working"))?,
    };

    let config = args.run_config(&working)?;
    tracing::info!(strategy = %config.strategy, cache = config.cache, "configured");

    let subject = Subject {
        data: absolute(&args.data)?,
        id: args.id.clone(),
        template: args.template.clone(),
        working: working.clone(),
        fs_flags: args.fs_flags.clone(),
        ants_flags: args.ants_flags.clone(),
        mb_flags: args.mb_flags.clone(),
    };

    let mut pipeline = stages::pipeline(&subject)?;

    let executor = Executor::new(config, Arc::new(LocalRunner), Arc::new(RunDirectory::new(out)))?;
    let report = executor.run(&mut pipeline)?;

    println!("{report}");

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("couldn't write {path}"))?;
    }

    if let Some(path) = &args.diagram {
        std::fs::write(path, report.render_mermaid(&pipeline))
            .with_context(|| format!("couldn't write {path}"))?;
    }

    if let Some(failure) = report.first_failure() {
        let reason = failure
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        eprintln!(
            "{} task '{}' failed: {}",
            style("error:").red().bold(),
            failure.name,
            reason
        );
    }

    Ok(ExitCode::from(report.exit_code()))
}
