//! tunerd: broadcast tuner arbiter with EPG gathering.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tunerd::catalog::Catalog;
use tunerd::config::{self, Args, Command, ConfigFile, Settings};
use tunerd::demux::FilterContext;
use tunerd::epg::EpgAssembler;
use tunerd::logging;
use tunerd::metrics::StreamMetrics;
use tunerd::tuner::{GatherOutcome, StreamRequest, TunerArbiter, TunerDevice};
use tunerd_model::{CatalogEvent, ChannelKey};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let file_config = match config::find_config(args.config.as_deref()) {
        Some(path) => match config::load_config(&path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };
    let settings = Settings::resolve(&args, file_config);

    logging::init_logging(
        &settings.log_dir,
        settings.log_retention_days,
        args.verbose,
        settings.log_level.as_deref(),
    )?;

    info!("tunerd starting...");
    info!("  Channels: {}", settings.channels.len());
    info!("  Tuners: {}", settings.tuners.len());

    let catalog = Catalog::new(settings.channels.clone(), settings.program_gc);
    let metrics = StreamMetrics::new();
    let ctx = FilterContext {
        epg: EpgAssembler::new(catalog.clone()),
        catalog,
        metrics: metrics.clone(),
    };
    let devices = settings
        .tuners
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, config)| TunerDevice::new(index, config, settings.device.clone()))
        .collect();
    let arbiter = Arc::new(TunerArbiter::new(devices, ctx.clone(), settings.arbiter.clone()));

    let result = match args.command {
        Command::Gather { once, .. } => run_gather(&arbiter, &ctx, &settings, once).await,
        Command::Stream {
            channel_type,
            channel,
            network_id,
            service_id,
            event_id,
            priority,
            disable_decoder,
            output,
        } => {
            let request = StreamRequest {
                network_id,
                service_id,
                event_id,
                priority,
                disable_decoder,
                ..StreamRequest::new(ChannelKey::new(channel_type, channel))
            };
            run_stream(&arbiter, request, output).await
        }
    };

    arbiter.shutdown().await;
    metrics.log_summary();
    info!("tunerd stopped");
    result
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn spawn_event_logger(mut rx: broadcast::Receiver<CatalogEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CatalogEvent::Service { kind, data }) => {
                    info!("[Catalog] service {:?} {} {}", kind, data.id, data.name);
                }
                Ok(CatalogEvent::Program { kind, data }) => {
                    if log::log_enabled!(log::Level::Debug) {
                        let json = serde_json::to_string(&data).unwrap_or_default();
                        debug!("[Catalog] program {:?} {}", kind, json);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("[Catalog] Event logger skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn sweep(arbiter: &TunerArbiter, channels: &[ChannelKey]) {
    for key in channels {
        match arbiter.gather_epg(key).await {
            Ok(GatherOutcome::Complete { .. }) => info!("[Gather] {} complete", key),
            Ok(GatherOutcome::TimedOut { .. }) => warn!("[Gather] {} timed out", key),
            Ok(GatherOutcome::Remote { imported }) => {
                info!("[Gather] {} imported {} programs from remote", key, imported)
            }
            Err(e) => error!("[Gather] {} failed: {}", key, e),
        }
    }
}

async fn run_gather(
    arbiter: &Arc<TunerArbiter>,
    ctx: &FilterContext,
    settings: &Settings,
    once: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let events = spawn_event_logger(ctx.catalog.subscribe());

    let epg = ctx.epg.clone();
    let gc_interval = settings.gc_interval;
    let gc = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc_interval);
        loop {
            ticker.tick().await;
            let removed = epg.gc(now_ms());
            if removed > 0 {
                info!("[Gather] Removed {} expired programs", removed);
            }
        }
    });

    let mut channels: Vec<ChannelKey> = settings.channels.iter().map(|c| c.key()).collect();
    channels.dedup();

    loop {
        tokio::select! {
            _ = sweep(arbiter, &channels) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
        info!(
            "[Gather] Sweep finished: {} services, {} programs",
            ctx.catalog.services.all().len(),
            ctx.catalog.programs.len()
        );
        if once {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(settings.gather_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    gc.abort();
    events.abort();
    Ok(())
}

async fn run_stream(
    arbiter: &TunerArbiter,
    request: StreamRequest,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    info!("Opening {}", request.target);
    let mut stream = arbiter.open_stream(request).await?;
    info!(
        "Streaming from device #{} (consumer {})",
        stream.device_index(),
        stream.consumer_id()
    );

    loop {
        tokio::select! {
            chunk = stream.recv() => match chunk {
                Some(chunk) => writer.write_all(&chunk).await?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing stream");
                break;
            }
        }
    }
    writer.flush().await?;

    if let Some(stats) = stream.finish().await {
        info!(
            "Stream finished: packets_in={} provided={} close_reason={:?}",
            stats.packets_in, stats.packets_provided, stats.close_reason
        );
    }
    Ok(())
}
