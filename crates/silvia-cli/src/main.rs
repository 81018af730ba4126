//! Silvia CLI - personal knowledge graph curator

use std::sync::Arc;

use clap::{Parser, Subcommand};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use silvia_core::config::Config;
use silvia_core::graph::{Entity, EntityStore, EntityType, GraphOps, UpdatePatch};
use silvia_core::llm::OpenRouterClient;
use silvia_core::queue::{Priority, SourceQueue};
use silvia_core::sources::SourceTracker;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Parser)]
#[command(name = "silvia")]
#[command(author, version, about = "Personal knowledge graph curator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Search entities by id, title, alias, tag, or content
    Search { query: String },

    /// Show an entity
    Show {
        /// Entity id (e.g., people/jane-doe)
        id: String,
    },

    /// Create a new entity
    Create {
        /// Entity id (e.g., people/jane-doe)
        id: String,
        /// Title (defaults to one derived from the id)
        #[arg(short, long)]
        title: Option<String>,
        /// Initial content
        #[arg(short, long)]
        content: Option<String>,
    },

    /// Update an entity's content, aliases, or tags
    Update {
        id: String,
        /// Replacement content
        #[arg(short, long)]
        content: Option<String>,
        /// Replacement aliases (comma-separated)
        #[arg(short, long)]
        aliases: Option<String>,
        /// Replacement tags (comma-separated)
        #[arg(short, long)]
        tags: Option<String>,
        /// Replacement sources (comma-separated; an empty string clears them)
        #[arg(short, long)]
        sources: Option<String>,
    },

    /// Add a typed relationship between two entities
    Link {
        /// Source entity id
        from: String,
        /// Relationship type (e.g., founded, spoke_at)
        rel_type: String,
        /// Target entity id
        to: String,
        /// Optional note
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Rename an entity, rewriting all references to it
    Rename {
        old_id: String,
        new_id: String,
    },

    /// Merge one entity into another
    Merge {
        /// Entity that survives
        keeper: String,
        /// Entity absorbed into the keeper
        absorbed: String,
    },

    /// Delete an entity (refused while other entities reference it)
    Delete { id: String },

    /// Show everything connected to an entity
    Related { id: String },

    /// List entities
    List {
        /// Restrict to one type (person, organization, concept, work, event)
        #[arg(short = 't', long = "type")]
        entity_type: Option<String>,
    },

    /// Recompute all back-references from authored relationships
    Rebuild,

    /// Rewrite an entity's content with the language model
    Refine {
        id: String,
        /// Extra guidance for the rewrite
        #[arg(short, long)]
        guidance: Option<String>,
    },

    /// Manage the queue of sources waiting to be processed
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Manage the processed-source record
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Interactive graph exploration
    Chat,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Add a URL to the queue
    Add {
        url: String,
        /// Priority (low, medium, high)
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Entity or source that led to this URL
        #[arg(short, long)]
        from: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List queued sources in processing order
    List,
    /// Remove and print the next source to process
    Pop,
    /// Remove a URL from the queue
    Remove { url: String },
    /// Change a queued source's priority
    Priority { url: String, priority: String },
    /// Empty the queue
    Clear,
}

#[derive(Subcommand)]
enum SourcesAction {
    /// List processed sources, most recent first
    List,
    /// Record a URL as processed
    Mark {
        url: String,
        title: String,
        /// Entity id of the archived capture
        #[arg(short, long)]
        storage: Option<String>,
    },
    /// Forget a processed URL
    Forget { url: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("silvia=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let store = Arc::new(EntityStore::new(&config.data_dir));
    store.init_directories()?;

    let ops = match config.llm.resolved_api_key()? {
        Some(api_key) => {
            let client = OpenRouterClient::builder()
                .config(config.llm.clone())
                .api_key(api_key)
                .build()?;
            GraphOps::with_llm(store.clone(), Arc::new(client))
        }
        None => {
            debug!("no API key set, LLM-backed operations unavailable");
            GraphOps::new(store.clone())
        }
    };

    match cli.command {
        Commands::Search { query } => cmd_search(&ops, &query, cli.format),

        Commands::Show { id } => cmd_show(&ops, &id, cli.format),

        Commands::Create { id, title, content } => {
            let (type_segment, _) = silvia_core::graph::split_id(&id)?;
            let entity_type = EntityType::parse(type_segment)
                .ok_or_else(|| anyhow::anyhow!("Unknown entity type: {}", type_segment))?;
            let entity = ops.create(entity_type, &id, title.as_deref(), content.as_deref())?;
            if !cli.quiet {
                println!("Created {}", entity.id);
            }
            Ok(())
        }

        Commands::Update {
            id,
            content,
            aliases,
            tags,
            sources,
        } => {
            let patch = UpdatePatch {
                content,
                aliases: aliases.map(|s| split_list(&s)),
                tags: tags.map(|s| split_list(&s)),
                sources: sources.map(|s| split_list(&s)),
            };
            ops.update(&id, patch)?;
            if !cli.quiet {
                println!("Updated {}", id);
            }
            Ok(())
        }

        Commands::Link {
            from,
            rel_type,
            to,
            note,
        } => {
            ops.link(&from, &rel_type, &to, note.as_deref())?;
            if !cli.quiet {
                println!("Linked {} -[{}]-> {}", from, rel_type, to);
            }
            Ok(())
        }

        Commands::Rename { old_id, new_id } => {
            ops.rename(&old_id, &new_id)?;
            if !cli.quiet {
                println!("Renamed {} to {}", old_id, new_id);
            }
            Ok(())
        }

        Commands::Merge { keeper, absorbed } => {
            let cancel = cancel_on_ctrl_c();
            let merged = ops.merge(&keeper, &absorbed, &cancel).await?;
            if !cli.quiet {
                println!("Merged {} into {}", absorbed, merged.id);
                println!("  Aliases: {}", merged.aliases.join(", "));
            }
            Ok(())
        }

        Commands::Delete { id } => {
            ops.delete(&id)?;
            if !cli.quiet {
                println!("Deleted {}", id);
            }
            Ok(())
        }

        Commands::Related { id } => cmd_related(&ops, &id),

        Commands::List { entity_type } => cmd_list(&ops, entity_type.as_deref(), cli.format),

        Commands::Rebuild => {
            let written = ops.rebuild_all_backrefs()?;
            if !cli.quiet {
                println!("Rebuilt back-references; {} documents updated.", written);
            }
            Ok(())
        }

        Commands::Refine { id, guidance } => {
            let cancel = cancel_on_ctrl_c();
            ops.refine(&id, guidance.as_deref(), &cancel).await?;
            if !cli.quiet {
                println!("Refined {}", id);
            }
            Ok(())
        }

        Commands::Queue { action } => cmd_queue(&config, action, cli.quiet),

        Commands::Sources { action } => cmd_sources(&config, action, cli.quiet),

        Commands::Config { action } => cmd_config(config, action),

        Commands::Chat => cmd_chat(&ops),
    }
}

/// Token cancelled when the user presses Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    cancel
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn entity_summary_json(entity: &Entity) -> serde_json::Value {
    serde_json::json!({
        "id": entity.id,
        "type": entity.entity_type.as_str(),
        "title": entity.title,
        "aliases": entity.aliases,
        "tags": entity.tags,
        "relationships": entity.relationships.len(),
        "backrefs": entity.backrefs.len(),
        "updated": entity.updated.to_rfc3339(),
    })
}

// ============================================================================
// Command Implementations
// ============================================================================

fn cmd_search(ops: &GraphOps, query: &str, format: OutputFormat) -> anyhow::Result<()> {
    let hits = ops.search(query)?;
    match format {
        OutputFormat::Json => {
            let json: Vec<_> = hits.iter().map(entity_summary_json).collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("No entities match '{}'.", query);
                return Ok(());
            }
            for entity in hits {
                println!("{}  {}", entity.id, entity.title);
            }
        }
    }
    Ok(())
}

fn cmd_show(ops: &GraphOps, id: &str, format: OutputFormat) -> anyhow::Result<()> {
    let entity = ops.get(id)?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entity_summary_json(&entity))?);
        }
        OutputFormat::Text => {
            println!("{}", silvia_core::graph::format_entity(&entity));
        }
    }
    Ok(())
}

fn cmd_related(ops: &GraphOps, id: &str) -> anyhow::Result<()> {
    let related = ops.related(id)?;
    println!("{} ({})", related.entity.title, related.entity.id);

    if !related.outgoing.is_empty() {
        println!("\nOutgoing:");
        for (rel_type, targets) in &related.outgoing {
            println!("  {}:", rel_type);
            for target in targets {
                println!("    {}  {}", target.id, target.title);
            }
        }
    }
    if !related.incoming.is_empty() {
        println!("\nIncoming:");
        for (rel_type, sources) in &related.incoming {
            println!("  {}:", rel_type);
            for source in sources {
                println!("    {}  {}", source.id, source.title);
            }
        }
    }
    if !related.broken_links.is_empty() {
        println!("\nBroken links:");
        for target in &related.broken_links {
            println!("  {}", target);
        }
    }
    if related.all.is_empty() {
        println!("\nNo connected entities.");
    }
    Ok(())
}

fn cmd_list(
    ops: &GraphOps,
    entity_type: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let filter = match entity_type {
        Some(name) => Some(
            EntityType::parse(name)
                .ok_or_else(|| anyhow::anyhow!("Unknown entity type: {}", name))?,
        ),
        None => None,
    };
    let entities = ops.list(filter)?;
    match format {
        OutputFormat::Json => {
            let json: Vec<_> = entities.iter().map(entity_summary_json).collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if entities.is_empty() {
                println!("No entities yet. Create one with: silvia create <type>/<slug>");
                return Ok(());
            }
            for entity in entities {
                println!("{}  {}", entity.id, entity.title);
            }
        }
    }
    Ok(())
}

fn cmd_queue(config: &Config, action: QueueAction, quiet: bool) -> anyhow::Result<()> {
    let queue = SourceQueue::open(&config.data_dir)?;
    match action {
        QueueAction::Add {
            url,
            priority,
            from,
            description,
        } => {
            let priority = Priority::parse(&priority)
                .ok_or_else(|| anyhow::anyhow!("Unknown priority: {} (use low, medium, or high)", priority))?;
            if queue.add(&url, priority, from, description)? {
                if !quiet {
                    println!("Queued {} ({})", url, priority);
                }
            } else if !quiet {
                println!("{} is already queued.", url);
            }
        }
        QueueAction::List => {
            let items = queue.get_all();
            if items.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            for item in items {
                match &item.description {
                    Some(desc) => println!("[{}] {}  {}", item.priority, item.url, desc),
                    None => println!("[{}] {}", item.priority, item.url),
                }
            }
        }
        QueueAction::Pop => match queue.pop()? {
            Some(item) => println!("{}", item.url),
            None => println!("Queue is empty."),
        },
        QueueAction::Remove { url } => {
            if queue.remove(&url)? {
                if !quiet {
                    println!("Removed {}", url);
                }
            } else {
                println!("{} is not queued.", url);
            }
        }
        QueueAction::Priority { url, priority } => {
            let priority = Priority::parse(&priority)
                .ok_or_else(|| anyhow::anyhow!("Unknown priority: {} (use low, medium, or high)", priority))?;
            if queue.update_priority(&url, priority)? {
                if !quiet {
                    println!("Set {} to {}", url, priority);
                }
            } else {
                println!("{} is not queued.", url);
            }
        }
        QueueAction::Clear => {
            queue.clear()?;
            if !quiet {
                println!("Queue cleared.");
            }
        }
    }
    Ok(())
}

fn cmd_sources(config: &Config, action: SourcesAction, quiet: bool) -> anyhow::Result<()> {
    let tracker = SourceTracker::open(&config.data_dir)?;
    match action {
        SourcesAction::List => {
            let sources = tracker.all();
            if sources.is_empty() {
                println!("No processed sources.");
                return Ok(());
            }
            for source in sources {
                println!(
                    "{}  {}  {}",
                    source.processed_at.format("%Y-%m-%d"),
                    source.url,
                    source.title
                );
            }
        }
        SourcesAction::Mark { url, title, storage } => {
            tracker.mark_processed(&url, &title, storage)?;
            if !quiet {
                println!("Marked {} as processed.", url);
            }
        }
        SourcesAction::Forget { url } => {
            if tracker.remove(&url)? {
                if !quiet {
                    println!("Forgot {}", url);
                }
            } else {
                println!("{} was not recorded as processed.", url);
            }
        }
    }
    Ok(())
}

fn cmd_config(mut config: Config, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} = {}", key, config.get(&key)?);
        }
        ConfigAction::List => {
            for (key, value) in config.list() {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
    }
    Ok(())
}

fn cmd_chat(ops: &GraphOps) -> anyhow::Result<()> {
    println!("Silvia interactive mode. Commands: search <query>, show <id>, related <id>, quit.");
    let mut editor = DefaultEditor::new()?;

    loop {
        match editor.readline("silvia> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                editor.add_history_entry(line)?;

                let (command, rest) = match line.split_once(' ') {
                    Some((command, rest)) => (command, rest.trim()),
                    None => (line, ""),
                };
                let result = match command {
                    "quit" | "exit" => break,
                    "search" => cmd_search(ops, rest, OutputFormat::Text),
                    "show" => cmd_show(ops, rest, OutputFormat::Text),
                    "related" => cmd_related(ops, rest),
                    _ => {
                        println!("Unknown command. Try: search, show, related, quit.");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    println!("Error: {}", e);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_trims_and_drops_empties() {
        assert_eq!(split_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("  ").is_empty());
    }

    #[test]
    fn test_cli_parses_core_commands() {
        use clap::Parser;
        let cli = Cli::try_parse_from(["silvia", "link", "people/jane", "founded", "organizations/acme"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["silvia", "queue", "add", "https://example.com", "--priority", "high"]);
        assert!(cli.is_ok());

        assert!(Cli::try_parse_from(["silvia"]).is_err());
    }
}
