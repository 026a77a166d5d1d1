// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use pushgw::{
    config::{self, Config},
    dispatcher::{Dispatcher, WriterSpec},
    errors::ConfigError,
    normalizer::Normalizer,
    pipeline::Pipeline,
    registry::{run_sweeper, Registry},
    relabel::{RelabelHook, Relabeler},
    server,
    stats::Stats,
    targets::{run_reloader, NoTargets, TargetCache, TargetLookup},
    writer::RemoteWriteWriter,
};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    let config = config::load();
    let log_level = config
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |c| c.log_level.as_str())
        .to_lowercase();
    init_logging(&log_level);

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading push gateway configuration: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let pipeline = match build_pipeline(&config, &cancel) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("Error starting push gateway: {e}");
            return;
        }
    };

    let listener = match TcpListener::bind(&config.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.listen);
            pipeline.dispatcher().shutdown().await;
            return;
        }
    };

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        info!("Shutting down push gateway");
        signal_cancel.cancel();
    });

    let router = server::router(Arc::clone(&pipeline), config.max_request_body_bytes);
    if let Err(e) = server::serve(listener, router, cancel.clone()).await {
        error!("HTTP server error: {e}");
        cancel.cancel();
    }

    pipeline.dispatcher().shutdown().await;
    debug!("Push gateway stopped");
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");
}

/// Wires registry, targets, writers and dispatcher together and starts the background tasks.
fn build_pipeline(config: &Config, cancel: &CancellationToken) -> Result<Pipeline, ConfigError> {
    let stats = Arc::new(Stats::default());
    let registry = Arc::new(Registry::new());
    tokio::spawn(run_sweeper(
        Arc::clone(&registry),
        config.ident.ttl(),
        config.ident.sweep_interval(),
        cancel.clone(),
    ));

    let targets: Arc<dyn TargetLookup> = match &config.targets.file {
        Some(path) => {
            let cache = Arc::new(
                TargetCache::from_file(path)
                    .map_err(|e| ConfigError::Invalid(format!("targets file: {e}")))?,
            );
            info!("Loaded {} targets from {}", cache.len(), path.display());
            tokio::spawn(run_reloader(
                Arc::clone(&cache),
                config.targets.reload_interval(),
                cancel.clone(),
            ));
            cache
        }
        None => Arc::new(NoTargets),
    };

    let hook: Option<Arc<dyn RelabelHook>> = if config.relabel.is_empty() {
        None
    } else {
        Some(Arc::new(Relabeler::new(&config.relabel)?))
    };

    let mut specs = Vec::with_capacity(config.writers.len());
    for writer_config in &config.writers {
        let relabeler = Relabeler::new(&writer_config.write_relabels)?;
        specs.push(WriterSpec {
            name: writer_config.name.clone(),
            writer: Arc::new(RemoteWriteWriter::from_config(writer_config)?),
            relabeler: (!relabeler.is_empty()).then_some(relabeler),
        });
        info!("Writer {} -> {}", writer_config.name, writer_config.url);
    }
    if specs.is_empty() {
        info!("No writers configured, samples will be discarded");
    }
    let dispatcher = Arc::new(Dispatcher::start(specs, config.dispatcher));

    let normalizer = Normalizer::new(
        Arc::clone(&registry),
        targets,
        hook,
        config.normalizer.clone(),
        Arc::clone(&stats),
    );
    let mut pipeline = Pipeline::new(normalizer, dispatcher, registry, stats)
        .with_ident_ttl(config.ident.ttl())
        .with_max_decoded_bytes(config.max_request_body_bytes);
    for (protocol, policy) in config.protocols.overrides() {
        debug!("Decode policy for {}: {policy:?}", protocol.name());
        pipeline = pipeline.with_policy(protocol, policy);
    }
    Ok(pipeline)
}
