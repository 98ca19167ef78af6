//! vnova CLI: command-line tools for narrative projects
//!
//! Validates, exports and re-imports project files, and runs one-off
//! generation jobs against the configured language model.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vnova::export::{import_project, DirectoryAssetResolver, ExportManifest};
use vnova::generation::{GenerationOrchestrator, JobStatus, LlmClient};
use vnova::graph::{validate_project, NodeId};
use vnova::{persistence, EngineConfig, Exporter, GraphStore};

#[derive(Parser)]
#[command(name = "vnova", version, about = "vnova narrative project tools")]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a project file and report unreachable nodes
    Validate {
        project: PathBuf,
    },
    /// Compile a project into a Ren'Py directory
    Export {
        project: PathBuf,
        out_dir: PathBuf,

        /// Asset root (defaults to the project file's directory)
        #[arg(long)]
        assets: Option<PathBuf>,
    },
    /// Rebuild a project file from an exported directory
    Import {
        dir: PathBuf,
        project: PathBuf,
    },
    /// Draft text for one node with the configured model
    Generate {
        project: PathBuf,
        node: u64,
        instruction: String,

        /// Engine configuration (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the draft into the project file
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Validate { project } => run_validate(&project, &cli.format),
        Commands::Export {
            project,
            out_dir,
            assets,
        } => run_export(&project, &out_dir, assets, &cli.format),
        Commands::Import { dir, project } => run_import(&dir, &project, &cli.format),
        Commands::Generate {
            project,
            node,
            instruction,
            config,
            apply,
        } => run_generate(&project, NodeId::new(node), &instruction, config, apply, &cli.format).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_validate(path: &Path, format: &OutputFormat) -> anyhow::Result<()> {
    let project = persistence::load(path).with_context(|| format!("loading {}", path.display()))?;
    validate_project(&project)?;
    let unreachable = project.unreachable_nodes();
    let stale = project.stale_emotions();

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "title": project.title,
                "version": project.schema_version,
                "nodes": project.node_count(),
                "edges": project.edge_count(),
                "characters": project.characters.len(),
                "start": project.start,
                "unreachable": unreachable,
                "stale_emotions": stale,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Property", "Value"]);
            table.add_row(vec!["Title".to_string(), project.title.clone()]);
            table.add_row(vec!["Version".to_string(), project.schema_version.to_string()]);
            table.add_row(vec!["Nodes".to_string(), project.node_count().to_string()]);
            table.add_row(vec!["Edges".to_string(), project.edge_count().to_string()]);
            table.add_row(vec!["Characters".to_string(), project.characters.len().to_string()]);
            table.add_row(vec![
                "Start".to_string(),
                project.start.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            ]);
            println!("{}", table);

            for id in &unreachable {
                println!("warning: {} is not reachable from the start node", id);
            }
            if !stale.is_empty() {
                println!("{} node(s) have stale emotion tags", stale.len());
            }
        }
    }
    Ok(())
}

fn run_export(
    path: &Path,
    out_dir: &Path,
    assets: Option<PathBuf>,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let project = persistence::load(path).with_context(|| format!("loading {}", path.display()))?;
    let store = GraphStore::new(project)?;

    let asset_root = assets.unwrap_or_else(|| {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let exporter = Exporter::new(Arc::new(DirectoryAssetResolver::new(asset_root)));
    let manifest = exporter.export(&store.snapshot(), out_dir)?;
    print_manifest(&manifest, format)
}

fn print_manifest(manifest: &ExportManifest, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(manifest)?),
        OutputFormat::Table => {
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["File", "Bytes", "SHA-256"]);
            for file in &manifest.files {
                table.add_row(vec![
                    file.path.clone(),
                    file.bytes.to_string(),
                    file.sha256[..12].to_string(),
                ]);
            }
            println!("{}", table);
            println!(
                "{} node(s) emitted, {} warning(s)",
                manifest.emitted_nodes.len(),
                manifest.warnings.len()
            );
        }
    }
    Ok(())
}

fn run_import(dir: &Path, path: &Path, format: &OutputFormat) -> anyhow::Result<()> {
    let project = import_project(dir).with_context(|| format!("importing {}", dir.display()))?;
    persistence::save(&project, path)?;

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "title": project.title,
                "nodes": project.node_count(),
                "characters": project.characters.len(),
                "saved_to": path,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => println!(
            "Imported '{}' ({} nodes, {} characters) into {}",
            project.title,
            project.node_count(),
            project.characters.len(),
            path.display()
        ),
    }
    Ok(())
}

async fn run_generate(
    path: &Path,
    node: NodeId,
    instruction: &str,
    config: Option<PathBuf>,
    apply: bool,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let config = match config {
        Some(config) => EngineConfig::load(&config)?,
        None => EngineConfig::default(),
    };
    let project = persistence::load(path).with_context(|| format!("loading {}", path.display()))?;
    let locale = project.default_locale.clone();
    let store = Arc::new(GraphStore::new(project)?);

    let client = LlmClient::new(&config.llm, config.generation.request_timeout())?;
    let orchestrator = GenerationOrchestrator::new(store.clone(), Arc::new(client), config.generation);
    let id = orchestrator.request(node, instruction)?;
    let job = orchestrator.wait(id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => match &job.status {
            JobStatus::Succeeded { draft } => {
                println!("{}", draft.text);
                for suggestion in &draft.suggestions {
                    println!("  - {}", suggestion);
                }
            }
            other => println!("Job {} ended as {}", job.id, other.name()),
        },
    }

    match (&job.status, job.accept(locale)) {
        (_, Some(mutation)) if apply => {
            let snapshot = store.apply(mutation).await?;
            persistence::save(snapshot.project(), path)?;
            eprintln!("Draft written to {}", path.display());
        }
        (JobStatus::Failed { error }, _) => bail!("generation failed: {}", error),
        _ => {}
    }
    Ok(())
}
