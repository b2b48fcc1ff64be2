mod cli;

use reelforge::config::{self, Config};
use reelforge::dispatcher::LocalDispatcher;
use reelforge::events::EventBus;
use reelforge::media_tools::FfmpegTools;
use reelforge::orchestrator::{EncodeMode, SkipReason};
use reelforge::worker::WorkerPool;
use reelforge::{EncodeRequest, ImportRequest, Orchestrator};
use reelforge_av::ToolRegistry;
use reelforge_common::{MediaId, TimeRange, TrimAction};
use reelforge_db::queries::{encodings, media, profiles};
use reelforge_db::{get_conn, init_pool};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a command needs to talk to the engine.
struct Engine {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<LocalDispatcher>,
}

impl Engine {
    fn open(config: Config) -> Result<Self> {
        tracing::info!("Opening database at {}", config.storage.db_path.display());
        let pool = init_pool(&config.storage.db_path)?;

        let tools = FfmpegTools::new(ToolRegistry::discover(&config.tools));
        let queue = Arc::new(LocalDispatcher::new());
        let events = Arc::new(EventBus::default());

        let orchestrator = Arc::new(Orchestrator::new(
            pool,
            Arc::new(config),
            Arc::new(tools),
            queue.clone(),
            events,
        ));
        Ok(Self {
            orchestrator,
            queue,
        })
    }

    fn workers(&self, concurrency: usize) -> WorkerPool {
        WorkerPool::new(self.orchestrator.clone(), self.queue.clone(), concurrency)
    }
}

async fn start(config_path: Option<&Path>, workers: Option<usize>) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;
    if let Some(workers) = workers {
        config.workers.concurrency = workers;
    }
    config::validate_config(&config)?;
    let concurrency = config.workers.concurrency;

    tracing::info!("Starting Reelforge with {} workers", concurrency);
    let engine = Engine::open(config)?;

    let report = engine.orchestrator.recover().await?;
    if report.interrupted > 0 {
        tracing::info!("Failed {} jobs interrupted by the previous shutdown", report.interrupted);
    }
    engine.orchestrator.sweep_orphans()?;

    let cancel = CancellationToken::new();
    let pool_handle = tokio::spawn(engine.workers(concurrency).run(cancel.clone()));

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    cancel.cancel();
    let _ = pool_handle.await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelforge=trace,reelforge_av=trace,reelforge_db=debug,reelforge_common=debug".to_string()
        } else {
            "reelforge=info,reelforge_av=info,reelforge_db=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Start { workers } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start(config_path, workers))
        }
        Commands::Import {
            source,
            owner,
            uid,
            title,
            encode,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(import(
                config_path,
                ImportRequest {
                    source,
                    owner,
                    uid,
                    title,
                },
                encode,
            ))
        }
        Commands::Encode {
            media,
            profiles,
            force,
            no_chunking,
            wait,
        } => {
            let mut request = EncodeRequest::new(media).force(force);
            if !profiles.is_empty() {
                request = request.profiles(profiles);
            }
            if no_chunking {
                request = request.allow_chunking(false);
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(encode(config_path, request, wait))
        }
        Commands::Trim {
            media,
            ranges,
            action,
            wait,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(trim(config_path, media, ranges, action, wait))
        }
        Commands::Status { media, json } => status(config_path, media, json),
        Commands::Profiles => list_profiles(config_path),
        Commands::SeedProfiles => {
            let engine = Engine::open(config::load_config_or_default(config_path)?)?;
            let added = engine.orchestrator.seed_profiles()?;
            println!("Added {} profiles", added);
            Ok(())
        }
        Commands::Cancel { encoding } => {
            let engine = Engine::open(config::load_config_or_default(config_path)?)?;
            let rt = tokio::runtime::Runtime::new()?;
            if rt.block_on(engine.orchestrator.cancel_encoding(encoding))? {
                println!("Cancelled {}", encoding);
            } else {
                println!("No such encoding: {}", encoding);
            }
            Ok(())
        }
        Commands::Delete { media } => {
            let engine = Engine::open(config::load_config_or_default(config_path)?)?;
            let rt = tokio::runtime::Runtime::new()?;
            if rt.block_on(engine.orchestrator.delete_media(media))? {
                println!("Deleted {}", media);
            } else {
                println!("No such media: {}", media);
            }
            Ok(())
        }
        Commands::CheckTools => check_tools(config_path),
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reelforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn import(config_path: Option<&Path>, request: ImportRequest, encode_now: bool) -> Result<()> {
    let engine = Engine::open(config::load_config_or_default(config_path)?)?;
    let media = engine.orchestrator.import_media(request).await?;
    println!("Imported {} ({})", media.id, media.uid);
    println!(
        "  {:.1}s, {}p, {:.3} fps",
        media.duration_secs, media.height, media.media_info.frame_rate
    );

    if encode_now {
        let report = engine
            .orchestrator
            .encode(EncodeRequest::new(media.id))
            .await?;
        print_report(&report);
    }
    Ok(())
}

async fn encode(config_path: Option<&Path>, request: EncodeRequest, wait: bool) -> Result<()> {
    let engine = Engine::open(config::load_config_or_default(config_path)?)?;
    let report = engine.orchestrator.encode(request).await?;
    print_report(&report);

    if wait {
        let ran = engine.workers(1).drain().await;
        println!("Ran {} jobs", ran);
    }
    Ok(())
}

async fn trim(
    config_path: Option<&Path>,
    media_id: MediaId,
    ranges: Vec<TimeRange>,
    action: TrimAction,
    wait: bool,
) -> Result<()> {
    let engine = Engine::open(config::load_config_or_default(config_path)?)?;
    let request = engine.orchestrator.trim(media_id, ranges, action).await?;
    println!("Trim {} is {}", request.id, request.status);
    if let Some(target) = request.target_media_id {
        println!("  Target media: {}", target);
    }

    if wait {
        let ran = engine.workers(1).drain().await;
        println!("Ran {} jobs", ran);
    }
    Ok(())
}

fn print_report(report: &reelforge::EncodeReport) {
    match &report.mode {
        EncodeMode::Idle => println!("Nothing to encode"),
        EncodeMode::SingleShot => println!("Queued {} jobs", report.queued.len()),
        EncodeMode::Chunked {
            group_key,
            segments,
        } => println!(
            "Queued {} chunk jobs over {} segments (group {})",
            report.queued.len(),
            segments,
            group_key
        ),
    }
    for (profile, reason) in &report.skipped {
        let why = match reason {
            SkipReason::Upscale => "would upscale the source".to_string(),
            SkipReason::Unsupported => "no bitrate for this resolution".to_string(),
            SkipReason::Occupied(id) => format!("already covered by {}", id),
        };
        println!("  skipped {}: {}", profile, why);
    }
}

fn status(config_path: Option<&Path>, media_id: Option<MediaId>, json: bool) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let pool = init_pool(&config.storage.db_path)?;
    let conn = get_conn(&pool)?;

    let all_media = match media_id {
        Some(id) => vec![media::require_media(&conn, id)?],
        None => media::list_media(&conn)?,
    };

    if json {
        let mut out = Vec::with_capacity(all_media.len());
        for m in &all_media {
            let records = encodings::list_for_media(&conn, m.id)?;
            out.push(serde_json::json!({ "media": m, "encodings": records }));
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for m in &all_media {
        println!("{} {} [{}] {}", m.id, m.uid, m.encoding_status, m.title);
        if let Some(ref manifest) = m.manifest_path {
            println!("  manifest: {}", manifest);
        }
        for e in encodings::list_for_media(&conn, m.id)? {
            let kind = if e.chunk { "chunk" } else { "rendition" };
            println!(
                "  {} {} {} {:>5.1}% retries={}",
                e.id, kind, e.status, e.progress, e.retries
            );
        }
    }

    println!();
    for (status, count) in encodings::count_by_status(&conn)? {
        println!("{}: {}", status, count);
    }
    Ok(())
}

fn list_profiles(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let pool = init_pool(&config.storage.db_path)?;
    let conn = get_conn(&pool)?;

    for p in profiles::list_profiles(&conn)? {
        let active = if p.active { "" } else { " (inactive)" };
        println!("{} {} {}p .{}{}", p.id, p.name, p.resolution, p.extension, active);
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let registry = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in registry.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. mp4hls is only needed for HLS packaging.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            config::load_config_or_default(None)?
        }
    };

    println!("✓ Configuration is valid");
    println!("  Media root: {}", config.storage.media_root.display());
    println!("  HLS dir: {}", config.storage.hls_dir.display());
    println!("  Database: {}", config.storage.db_path.display());
    println!("  Workers: {}", config.workers.concurrency);
    println!(
        "  Chunking: {} (threshold {}s, chunks {}s)",
        config.encoding.allow_chunking,
        config.encoding.chunking_threshold_secs,
        config.encoding.chunk_duration_secs
    );
    println!(
        "  Packaging: {} ({}s segments)",
        config.packaging.enabled, config.packaging.segment_duration_secs
    );
    Ok(())
}
