//! CLI for Genly - tiered image and video generation.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use genly::{
    GenerateOptions, GenerationRequest, GenlyConfig, MediaKind, MediaResult, MediaStore, Orchestrator,
    Progress, QualityTier, ReferenceImage, SaveMetadata, StoredMediaRecord,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "genly")]
#[command(about = "Generate images and videos through Runware, CometAPI, and fal.ai")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Retries for rate limits and transient provider failures
    #[arg(long, global = true, default_value_t = 0)]
    retries: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an image from a text prompt
    Image(ImageArgs),

    /// Generate a video from a text prompt
    Video(VideoArgs),

    /// Browse and manage saved media
    #[command(subcommand)]
    Gallery(GalleryCommand),

    /// List quality tiers and their providers
    Tiers,
}

#[derive(Args)]
struct CommonArgs {
    /// The text prompt describing the media
    prompt: String,

    /// Explicit model id (bypasses tier routing)
    #[arg(short, long)]
    model: Option<String>,

    /// Reference image: URL, data URI, or file path (repeatable)
    #[arg(short, long = "reference")]
    references: Vec<String>,

    /// What to avoid
    #[arg(long)]
    negative: Option<String>,

    /// Seed for reproducible generation
    #[arg(long)]
    seed: Option<u64>,

    /// Width in pixels
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Height in pixels
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Save the result to the local gallery
    #[arg(long)]
    save: bool,
}

#[derive(Args)]
struct ImageArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Quality tier (standard, premium, ultra)
    #[arg(short, long, default_value = "standard")]
    tier: QualityTier,

    /// Guidance scale
    #[arg(long)]
    cfg: Option<f32>,
}

#[derive(Args)]
struct VideoArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Quality tier (video-standard, video-sync, video-async, effects)
    #[arg(short, long, default_value = "video-standard")]
    tier: QualityTier,

    /// Video duration in seconds
    #[arg(short, long)]
    duration: Option<u32>,

    /// Effect template name (effects tier)
    #[arg(short, long)]
    effect: Option<String>,
}

#[derive(Subcommand)]
enum GalleryCommand {
    /// List saved media, newest first
    List {
        /// Only this kind
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Show one record
    Show {
        /// Record id
        id: String,
    },
    /// Print a renderable URL for a record
    Resolve {
        /// Record id
        id: String,
    },
    /// Delete a record and its stored bytes
    Delete {
        /// Record id
        id: String,
    },
    /// Delete every record of a kind
    Clear {
        /// Kind to clear
        #[arg(value_enum)]
        kind: KindArg,
    },
    /// Delete stored bytes no record refers to
    Prune,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Image,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Image => MediaKind::Image,
            KindArg::Video => MediaKind::Video,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("genly=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = GenlyConfig::from_env();

    match cli.command {
        Commands::Image(args) => {
            let ImageArgs { common, tier, cfg } = args;
            if tier.media_kind() != MediaKind::Image {
                anyhow::bail!("{tier} is a video tier; use `genly video`");
            }
            let mut request = build_request(&common, tier);
            if let Some(cfg) = cfg {
                request = request.with_cfg_scale(cfg);
            }
            generate(&config, request, common.save, cli.json, cli.retries).await?;
        }
        Commands::Video(args) => {
            let VideoArgs {
                common,
                tier,
                duration,
                effect,
            } = args;
            if tier.media_kind() != MediaKind::Video {
                anyhow::bail!("{tier} is an image tier; use `genly image`");
            }
            let mut request = build_request(&common, tier);
            if let Some(duration) = duration {
                request = request.with_duration(duration);
            }
            if let Some(effect) = effect {
                request = request.with_effect(effect);
            }
            generate(&config, request, common.save, cli.json, cli.retries).await?;
        }
        Commands::Gallery(command) => {
            gallery(&MediaStore::from_config(&config), command, cli.json).await?;
        }
        Commands::Tiers => {
            list_tiers(&Orchestrator::from_config(&config), cli.json)?;
        }
    }

    Ok(())
}

fn build_request(args: &CommonArgs, tier: QualityTier) -> GenerationRequest {
    let mut request = GenerationRequest::new(&args.prompt, tier);
    if let (Some(w), Some(h)) = (args.width, args.height) {
        request = request.with_size(w, h);
    }
    if let Some(model) = &args.model {
        request = request.with_model(model);
    }
    if let Some(negative) = &args.negative {
        request = request.with_negative_prompt(negative);
    }
    if let Some(seed) = args.seed {
        request = request.with_seed(seed);
    }
    for reference in &args.references {
        request = request.with_reference(ReferenceImage::parse(reference));
    }
    request
}

async fn generate(
    config: &GenlyConfig,
    request: GenerationRequest,
    save: bool,
    json_output: bool,
    retries: u32,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::builder_from_config(config).max_retries(retries).build();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            on_interrupt.cancel();
        }
    });

    let progress = if json_output {
        Progress::none()
    } else {
        Progress::new(|percent| eprint!("\rProgress: {percent:>3}%"))
    };
    let options = GenerateOptions { progress, cancel };

    let result = match orchestrator.generate_with(&request, options).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => {
            eprintln!();
            anyhow::bail!("generation cancelled");
        }
        Err(e) => {
            eprintln!();
            return Err(e.into());
        }
    };
    if !json_output {
        eprintln!();
    }

    let record = if save {
        let store = MediaStore::from_config(config);
        Some(store.save(&result, SaveMetadata::new(&request.prompt)).await?)
    } else {
        None
    };

    if json_output {
        let output = serde_json::json!({
            "success": true,
            "result": result,
            "saved": record,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_result(&result);
        if let Some(record) = record {
            println!("Saved: {}", record.id);
        }
    }

    Ok(())
}

fn print_result(result: &MediaResult) {
    println!("Generated {}: {}", result.kind, display_url(&result.url));
    match result.fallback_from {
        Some(from) => println!("Tier: {} (switched from {from})", result.tier),
        None => println!("Tier: {}", result.tier),
    }
    println!("Model: {}", result.model);
    if let Some(cost) = result.cost {
        println!("Cost: ${cost:.4}");
    }
    if let Some(seed) = result.seed {
        println!("Seed: {seed}");
    }
}

/// Shortens inline data URIs for terminal output.
fn display_url(url: &str) -> String {
    if url.starts_with("data:") {
        let header = url.split(',').next().unwrap_or("data:");
        format!("{header},... ({} chars)", url.len())
    } else {
        url.to_string()
    }
}

async fn gallery(store: &MediaStore, command: GalleryCommand, json_output: bool) -> anyhow::Result<()> {
    match command {
        GalleryCommand::List { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind.into()],
                None => MediaKind::ALL.to_vec(),
            };
            let mut records = Vec::new();
            for kind in kinds {
                records.extend(store.list_all(kind).await?);
            }
            if json_output {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("Gallery is empty");
            } else {
                for record in &records {
                    print_record_line(record);
                }
            }
        }
        GalleryCommand::Show { id } => {
            let record = store.get(&id).await?.with_context(|| format!("no record with id {id}"))?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record_line(&record);
                println!("  prompt: {}", record.prompt);
                println!("  url: {}", display_url(&record.url));
                if let Some(model) = &record.model {
                    println!("  model: {model}");
                }
                for (key, value) in &record.provider_metadata {
                    println!("  {key}: {value}");
                }
            }
        }
        GalleryCommand::Resolve { id } => {
            let record = store.get(&id).await?.with_context(|| format!("no record with id {id}"))?;
            let url = store.resolve(&record).await;
            if json_output {
                println!("{}", serde_json::json!({ "id": id, "url": url }));
            } else {
                println!("{url}");
            }
        }
        GalleryCommand::Delete { id } => {
            let record = store.delete(&id).await?;
            if json_output {
                println!("{}", serde_json::json!({ "deleted": record.id }));
            } else {
                println!("Deleted {}", record.id);
            }
        }
        GalleryCommand::Clear { kind } => {
            let kind: MediaKind = kind.into();
            let removed = store.clear_all(kind).await?;
            if json_output {
                println!("{}", serde_json::json!({ "kind": kind, "removed": removed }));
            } else {
                println!("Removed {removed} {}", kind.plural());
            }
        }
        GalleryCommand::Prune => {
            let pruned = store.prune_orphans().await?;
            if json_output {
                println!("{}", serde_json::json!({ "pruned": pruned }));
            } else {
                println!("Pruned {} orphaned blob(s)", pruned.len());
            }
        }
    }
    Ok(())
}

fn print_record_line(record: &StoredMediaRecord) {
    let when = chrono::DateTime::from_timestamp_millis(record.timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| record.timestamp.to_string());
    let location = if record.is_local_ref { "local" } else { "remote" };
    println!("{}  {}  {:<6} {:<7} {}", record.id, when, record.kind().to_string(), location, record.prompt);
}

fn list_tiers(orchestrator: &Orchestrator, json_output: bool) -> anyhow::Result<()> {
    let routes = orchestrator.routes();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&routes)?);
        return Ok(());
    }

    for kind in MediaKind::ALL {
        println!("{}:", kind.plural().to_uppercase());
        for route in routes.iter().filter(|r| r.tier.media_kind() == kind) {
            let status = if route.configured { "✓" } else { "✗" };
            println!("  {} {:<15} {} [{}]", status, route.tier.as_str(), route.provider, route.model);
            println!("    API key: {}", route.credential);
            if let Some(fallback) = route.fallback {
                println!("    With references: falls back to {fallback}");
            }
        }
        println!();
    }
    Ok(())
}
