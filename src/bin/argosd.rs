//! argosd - detection and tracking daemon
//!
//! This daemon:
//! 1. Loads configuration (file, then ARGOS_* environment overrides)
//! 2. Registers the preset and configured backends, and the configured zones
//! 3. Opens the frame source and runs the frame loop
//! 4. Forwards alerts to MQTT when a broker is configured, otherwise to the log
//! 5. Logs a health line every 5 seconds until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use argos_core::alerts::{LogSink, MqttEndpoint, MqttSink, SinkWorker};
use argos_core::{open_source, ArgosConfig, AlertSink, Pipeline, PipelineHandle};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const ALERT_QUEUE: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-backend detection, tracking and zone alerts")]
struct Args {
    /// Configuration file (.toml, otherwise JSON).
    #[arg(long, env = "ARGOS_CONFIG")]
    config: Option<PathBuf>,

    /// Frame source URL (overrides the config file).
    #[arg(long)]
    source: Option<String>,

    /// Backend preset id (overrides the config file).
    #[arg(long)]
    preset: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ArgosConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source.url = source;
    }
    if let Some(preset) = args.preset {
        cfg.preset = Some(preset);
    }

    let control = cfg.control_plane()?;
    for backend in control.backends()? {
        log::info!(
            "backend {} ({}) model '{}' health {:?}",
            backend.id,
            backend.kind,
            backend.model,
            backend.health
        );
    }
    let caps = control.combined_capabilities()?;
    log::info!(
        "{} backends enabled, pose: {}, max fps: {:?}",
        caps.backends_count,
        caps.supports_pose,
        caps.max_fps
    );

    let sink: Box<dyn AlertSink> = match &cfg.mqtt {
        Some(mqtt) => {
            let endpoint = MqttEndpoint::parse(&mqtt.broker)?;
            Box::new(MqttSink::connect(&endpoint, &mqtt.topic, "argosd")?)
        }
        None => Box::new(LogSink),
    };
    let pipeline = Pipeline::new(control, cfg.pipeline.clone())?
        .with_alert_sink(SinkWorker::spawn(sink, ALERT_QUEUE)?);
    let source = open_source(cfg.source.clone())?;
    let handle = PipelineHandle::start(pipeline, source)?;
    log::info!("argosd session {} running", handle.stats().session_id);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    loop {
        match rx.recv_timeout(HEALTH_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let stats = handle.stats();
                log::info!(
                    "health: state {:?}, frames {}, failed {}, tracks {}, alerts {}, subscribers {}",
                    stats.state,
                    stats.frames_processed,
                    stats.frames_failed,
                    stats.active_tracks,
                    stats.alerts_dispatched,
                    stats.subscribers
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    handle.stop()?;
    Ok(())
}
