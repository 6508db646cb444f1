//! voxmeshd: voice messages over a mesh.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use voxmesh_core::VoxmeshConfig;
use voxmesh_services::{
    Destination, InboundRouter, ReassemblyEngine, SendPipeline, SendReport, SendSettings,
    UdpMeshTransport, VoiceCodec, ZstdCodec,
};

mod inbox;
mod sweep;

fn print_usage() {
    println!("Usage: voxmeshd [command]");
    println!();
    println!("Commands:");
    println!("  (none)               Listen for voice messages and store them in the inbox");
    println!("  send <file> [tier]   Compress a raw PCM file and broadcast it");
    println!("  test <text>          Broadcast a test message");
    println!();
    println!("Configuration: {}", VoxmeshConfig::file_path().display());
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = VoxmeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VoxmeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VoxmeshConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        [] | ["listen"]                  => cmd_listen(config).await,
        ["send", file]                   => cmd_send(config, Path::new(file), None).await,
        ["send", file, tier]             => cmd_send(config, Path::new(file), Some(*tier)).await,
        ["test", text @ ..] if !text.is_empty() => cmd_test(config, &text.join(" ")).await,
        ["help"] | ["--help"] | ["-h"]   => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

async fn bind_transport(config: &VoxmeshConfig) -> Result<Arc<UdpMeshTransport>> {
    let transport = UdpMeshTransport::bind(
        &config.network.bind_addr,
        &config.network.peers,
        config.network.connect_timeout(),
    )
    .await
    .with_context(|| format!("failed to bring up mesh adapter on {}", config.network.bind_addr))?;
    Ok(Arc::new(transport))
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_listen(config: VoxmeshConfig) -> Result<()> {
    let transport = bind_transport(&config).await?;
    let app_port = config.network.app_port;
    let receive_timeout = config.chunking.receive_timeout();
    tracing::info!(
        addr = %transport.local_addr()?,
        app_port,
        receive_timeout_secs = receive_timeout.as_secs(),
        inbox = %config.storage.inbox_path.display(),
        "voxmeshd listening"
    );

    let engine = Arc::new(ReassemblyEngine::new(transport.clone(), app_port, receive_timeout));
    let (router, events) = InboundRouter::new(app_port, engine);
    let router = Arc::new(router);
    let codec: Arc<dyn VoiceCodec> = Arc::new(ZstdCodec::new(config.audio.clone()));
    let inbox = inbox::Inbox::new(config.storage.inbox_path.clone(), codec)?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receive_task = {
        let transport = transport.clone();
        let router = router.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = transport.receive_loop(router, shutdown).await {
                tracing::error!(error = %e, "receive loop failed");
            }
        })
    };

    let sweep_task = tokio::spawn(sweep::sweep_loop(
        router.clone(),
        sweep::interval_for(receive_timeout),
        shutdown_tx.subscribe(),
    ));

    let inbox_task = tokio::spawn(inbox::inbox_loop(inbox, events, shutdown_tx.subscribe()));

    let mut shutdown_rx = shutdown_tx.subscribe();
    shutdown_rx.recv().await.ok();
    tracing::info!("shutting down");

    let _ = tokio::join!(receive_task, sweep_task, inbox_task);
    Ok(())
}

async fn cmd_send(config: VoxmeshConfig, file: &Path, tier: Option<&str>) -> Result<()> {
    let pcm = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let budget = match tier {
        Some(tier) => config.chunking.wire_budget(tier),
        None => config.chunking.default_tier().1,
    };

    let codec = ZstdCodec::new(config.audio.clone());
    let quality = config.audio.default_quality.clone();
    let compressed = codec
        .compress(&pcm, &quality)
        .context("failed to compress voice")?;
    tracing::info!(
        file = %file.display(),
        pcm = pcm.len(),
        compressed = compressed.len(),
        %quality,
        budget,
        "sending voice message"
    );

    let transport = bind_transport(&config).await?;
    let pipeline = Arc::new(SendPipeline::new(transport, SendSettings::from_config(&config)));
    close_on_ctrl_c(pipeline.clone());

    match pipeline
        .send_voice(Bytes::from(compressed), &Destination::Broadcast, budget)
        .await
    {
        Ok(report) => {
            log_report(&report);
            Ok(())
        }
        Err(e) => bail!("voice message was not sent: {e}"),
    }
}

async fn cmd_test(config: VoxmeshConfig, text: &str) -> Result<()> {
    let transport = bind_transport(&config).await?;
    let pipeline = SendPipeline::new(transport, SendSettings::from_config(&config));
    let report = pipeline
        .send_test(text, &Destination::Broadcast)
        .await
        .context("test message was not sent")?;
    log_report(&report);
    Ok(())
}

/// Ctrl-C aborts an in-flight send.
fn close_on_ctrl_c(pipeline: Arc<SendPipeline>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, closing send pipeline");
            pipeline.close();
        }
    });
}

fn log_report(report: &SendReport) {
    match report {
        SendReport::NothingToSend => tracing::warn!("nothing to send"),
        SendReport::SinglePacket { bytes } => tracing::info!(bytes, "sent as a single packet"),
        SendReport::Chunked { chunk_id, chunks, bytes } => {
            tracing::info!(%chunk_id, chunks, bytes, "sent as chunked message")
        }
    }
}
