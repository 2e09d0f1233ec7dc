use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use folio_common::FolioConfig;
use folio_common::telemetry::{self, TelemetryConfig};
use folio_drafts::store::{FileDraftStore, FilePublishedStore};
use folio_drafts::{
    ChangeStore, ChangeValue, ContentSnapshot, EventBus, ProjectId, PublishedCache, Publisher,
    SyncTracker,
};
use miette::{IntoDiagnostic, Result};

#[derive(Parser)]
#[command(version, about = "Folio - inspect and publish project drafts", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a folio.toml config file
    #[arg(long, env = "FOLIO_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the draft and published files (overrides the config)
    #[arg(long, env = "FOLIO_STORE")]
    store: Option<PathBuf>,

    /// Print engine metrics in prometheus format when done
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the current draft records of a project
    Drafts { project: String },
    /// Print the resolved blocks of a section and where they came from
    Show { project: String, section: String },
    /// Throw away every draft of a project
    ClearDrafts { project: String },
    /// Promote a project's drafts to its published snapshot
    Publish { project: String },
}

/// File-backed engine pieces for one project.
struct Engine {
    drafts: Arc<FileDraftStore>,
    store: ChangeStore<FileDraftStore>,
    published: PublishedCache<FilePublishedStore>,
}

impl Engine {
    fn open(config: &FolioConfig, dir: PathBuf, project: &str) -> Self {
        let drafts = Arc::new(FileDraftStore::new(&dir));
        let published = PublishedCache::new(Arc::new(FilePublishedStore::new(&dir)), &config.cache);
        let store = ChangeStore::new(
            drafts.clone(),
            ProjectId::new(project),
            EventBus::new(),
            SyncTracker::new(config.drafts.watchdog()),
        );
        Self {
            drafts,
            store,
            published,
        }
    }

    fn publisher(&self) -> Publisher<FileDraftStore, FilePublishedStore> {
        Publisher::new(self.store.clone(), self.published.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(TelemetryConfig::from_env("folio-cli"));

    let config = match &cli.config {
        Some(path) => FolioConfig::load(path)?,
        None => FolioConfig::default(),
    };
    let dir = cli.store.clone().unwrap_or_else(|| config.storage.dir.clone());
    tracing::debug!(dir = %dir.display(), "using store directory");

    match cli.command {
        Commands::Drafts { project } => list_drafts(Engine::open(&config, dir, &project)).await?,
        Commands::Show { project, section } => {
            show_section(Engine::open(&config, dir, &project), &section).await?
        }
        Commands::ClearDrafts { project } => {
            Engine::open(&config, dir, &project)
                .publisher()
                .clear_drafts()
                .await?;
            println!("✓ Cleared drafts of {project}");
        }
        Commands::Publish { project } => {
            let engine = Engine::open(&config, dir, &project);
            let pending = engine.store.get_all_changes().await?.len();
            if pending == 0 {
                println!("Nothing to publish for {project}");
            } else {
                let snapshot = engine.publisher().publish().await?;
                println!("✓ Published {pending} draft(s) of {project}");
                if let Some(at) = snapshot.published_at {
                    println!("  at {}", at.to_rfc3339());
                }
            }
        }
    }

    if cli.metrics {
        eprintln!("{}", telemetry::render());
    }
    Ok(())
}

async fn list_drafts(engine: Engine) -> Result<()> {
    let records = engine.drafts.records(engine.store.project()).await?;
    if records.is_empty() {
        println!("No drafts for {}", engine.store.project());
        return Ok(());
    }
    for record in records {
        let summary = match &record.value {
            ChangeValue::Text(text) => format!("{text:?}"),
            ChangeValue::Image(url) => url.clone(),
            ChangeValue::ContentBlock(blocks) => format!("{} block(s)", blocks.len()),
        };
        println!(
            "{:<40} {}  {}",
            record.storage_key(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            summary
        );
    }
    Ok(())
}

async fn show_section(engine: Engine, section: &str) -> Result<()> {
    let drafts = engine.store.get_all_changes().await?;
    let published = engine.published.get(engine.store.project()).await?;
    let content = ContentSnapshot { drafts, published };
    let resolved = content.blocks(section, None);

    println!("# {section} ({:?}, {} block(s))", resolved.tier, resolved.value.len());
    let body = serde_json::to_string_pretty(resolved.value).into_diagnostic()?;
    println!("{body}");
    Ok(())
}
