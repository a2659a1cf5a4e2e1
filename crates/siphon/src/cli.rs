use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use siphon_ingest::{DirectoryManifests, IngestConfig, IngestCoordinator, ManifestPolicy};
use siphon_store::FsDir;
use tracing::{error, info};

/// Exit code of a run that finished but had entries fail.
const EXIT_ENTRY_FAILURES: u8 = 2;

#[derive(Clone, Debug, Parser)]
#[command(name = "siphon", version = env!("CARGO_PKG_VERSION"), about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Configuration file [default: siphon.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory backing the store
    #[arg(long, global = true)]
    pub store_root: Option<PathBuf>,

    /// Working directory, relative to the store root
    #[arg(long, global = true)]
    pub working_dir: Option<String>,

    /// More log output; repeat for more. SIPHON_LOG overrides this.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// Stream an export archive into the working directory
    #[command(alias = "i", name = "ingest")]
    Ingest(IngestArg),
    /// Empty the working directory
    #[command(name = "clean")]
    Clean,
}

#[derive(Clone, Debug, Args)]
pub struct IngestArg {
    /// Archive to read
    pub archive: PathBuf,

    /// Platform whose manifest filters the archive
    #[arg(short, long)]
    pub platform: String,

    /// Directory holding `<platform>.json` manifests
    #[arg(long)]
    pub manifest_dir: Option<PathBuf>,

    /// Fail instead of accepting every entry when no manifest is found
    #[arg(long)]
    pub strict: bool,

    /// Empty the working directory before streaming
    #[arg(long)]
    pub clean: bool,
}

impl Cli {
    fn config(&self) -> anyhow::Result<IngestConfig> {
        let mut config: IngestConfig = IngestConfig::figment(self.config.as_deref())
            .extract()
            .context("failed to load configuration")?;
        if let Some(root) = &self.store_root {
            config = config.store_root(root);
        }
        if let Some(dir) = &self.working_dir {
            config = config.working_dir(dir);
        }
        if let Commands::Ingest(arg) = &self.cmd {
            if let Some(dir) = &arg.manifest_dir {
                config = config.manifest_dir(dir);
            }
            if arg.strict {
                config = config.manifest_policy(ManifestPolicy::Reject);
            }
            if arg.clean {
                config = config.clear_before_ingest(true);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> anyhow::Result<ExitCode> {
        let config = self.config()?;
        let root = FsDir::open(&config.store_root)
            .await
            .with_context(|| format!("cannot open store at {}", config.store_root.display()))?;
        let manifests = DirectoryManifests::new(&config.manifest_dir);
        let mut coordinator = IngestCoordinator::new(root, manifests, config);

        match self.cmd {
            Commands::Ingest(arg) => ingest(&mut coordinator, arg).await,
            Commands::Clean => {
                let removed = coordinator.clear_working_directory().await?;
                info!(removed, "working directory cleared");
                println!("removed {removed} entries");
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

async fn ingest(
    coordinator: &mut IngestCoordinator<FsDir, DirectoryManifests>,
    arg: IngestArg,
) -> anyhow::Result<ExitCode> {
    let file = tokio::fs::File::open(&arg.archive)
        .await
        .with_context(|| format!("cannot open archive {}", arg.archive.display()))?;

    match coordinator.ingest_archive(&arg.platform, file).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.has_failures() {
                Ok(ExitCode::from(EXIT_ENTRY_FAILURES))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(failure) => {
            error!(kind = ?failure.kind(), phase = %failure.phase, "ingestion aborted");
            eprintln!("{}", serde_json::to_string_pretty(&failure.partial)?);
            Err(anyhow::Error::new(failure))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_arguments_parse() {
        let cli = Cli::try_parse_from([
            "siphon",
            "-vv",
            "--store-root",
            "/tmp/store",
            "ingest",
            "--platform",
            "acme",
            "--strict",
            "export.zip",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.store_root, Some(PathBuf::from("/tmp/store")));
        let Commands::Ingest(arg) = cli.cmd else {
            panic!("expected ingest");
        };
        assert_eq!(arg.platform, "acme");
        assert_eq!(arg.archive, PathBuf::from("export.zip"));
        assert!(arg.strict);
        assert!(!arg.clean);
    }

    #[test]
    fn clean_takes_global_options_after_the_subcommand() {
        let cli = Cli::try_parse_from(["siphon", "clean", "--working-dir", "scratch"]).unwrap();
        assert!(matches!(cli.cmd, Commands::Clean));
        assert_eq!(cli.working_dir.as_deref(), Some("scratch"));
    }
}
