//! Frameproc demo: synthetic camera feeding the plugin pipeline

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use frameproc::capture::SyntheticCapture;
use frameproc::pipeline::{AsyncRunner, Dispatcher, FrameOutput, FrameReport, PluginOutcome};
use frameproc::plugin::{builtin, PluginRegistry};
use frameproc::scheduler::{ExecutionContext, TokioContext, WorkerThread};
use frameproc::{Config, ContextKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("frameproc=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Frameproc launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    frameproc::CONFIG.store(Arc::new(Config::load(path.as_deref())?));
    let config = frameproc::CONFIG.load_full();

    // Counters recorded by the pipeline, rendered on shutdown
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| eyre!("failed to install metrics recorder: {}", e))?;

    let registry = PluginRegistry::global();
    builtin::register_builtin(&registry)?;
    info!("Registered plugins: {:?}", registry.names());

    let mut plugins = config.plugins.clone();
    if plugins.is_empty() {
        plugins.push(frameproc::PluginConfig::named(builtin::EXAMPLE_PLUGIN));
    }

    // Processing context
    let processing = &config.processing;
    let mut worker = None;
    let mut tokio_context = None;
    let context: Arc<dyn ExecutionContext> = match processing.context {
        ContextKind::Thread => {
            let thread = Arc::new(WorkerThread::spawn_pinned(
                processing.worker_name.clone(),
                processing.pin_core,
            )?);
            worker = Some(thread.clone());
            thread
        }
        ContextKind::Tokio => {
            let ctx = Arc::new(
                TokioContext::current(processing.worker_name.clone())
                    .ok_or_else(|| eyre!("no Tokio runtime available"))?,
            );
            tokio_context = Some(ctx.clone());
            ctx
        }
    };

    let (report_tx, report_rx) = flume::bounded::<FrameReport>(processing.report_queue);
    let mut dispatcher = Dispatcher::new(registry, &plugins)?;

    let async_worker = if processing.async_worker {
        let thread = Arc::new(WorkerThread::spawn(format!("{}-async", processing.worker_name))?);
        dispatcher.set_async_runner(AsyncRunner::new(thread.clone()), report_tx.clone());
        Some(thread)
    } else {
        None
    };

    info!("Dispatching to {:?}", dispatcher.plugin_names());
    let output = Arc::new(FrameOutput::new(
        context,
        dispatcher,
        processing.ring_buffer_size,
        report_tx,
    ));

    // Spawn report consumer
    let report_task = tokio::spawn(async move {
        while let Ok(report) = report_rx.recv_async().await {
            for result in &report.results {
                match &result.outcome {
                    PluginOutcome::Completed(value) => debug!(
                        sequence = report.sequence,
                        deferred = report.deferred,
                        "{} -> {:?}",
                        result.plugin,
                        value
                    ),
                    PluginOutcome::Failed(err) => {
                        warn!(sequence = report.sequence, "{} failed: {}", result.plugin, err)
                    }
                    _ => {}
                }
            }
        }
    });

    // Spawn capture thread
    let stop = Arc::new(AtomicBool::new(false));
    let capture_handle = {
        let stop = stop.clone();
        let output = output.clone();
        let mut capture = SyntheticCapture::new(config.capture.clone());
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                capture.run(&stop, |frame| match output.push(frame) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Pipeline stopped accepting frames: {}", e);
                        false
                    }
                });
                capture.frames_captured()
            })?
    };

    match processing.run_for_secs {
        Some(secs) => {
            info!("Running for {} seconds", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                res = tokio::signal::ctrl_c() => res?,
            }
        }
        None => {
            info!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("Frameproc shutting down");
    stop.store(true, Ordering::Release);
    let captured = capture_handle
        .join()
        .map_err(|_| eyre!("capture thread panicked"))?;

    output.shutdown();
    if let Some(worker) = &worker {
        worker.shutdown();
    }
    if let Some(worker) = &async_worker {
        worker.shutdown();
    }
    if let Some(ctx) = &tokio_context {
        ctx.close();
    }

    let metrics = output.metrics();
    drop(output);
    if let Err(e) = report_task.await {
        error!("Report consumer failed: {}", e);
    }

    info!(
        "Captured {} frames, processed {}, dropped {}, {} wake-ups ({} signals coalesced), {} plugin failures, {:.1} us avg",
        captured,
        metrics.frames_processed,
        metrics.frames_dropped,
        metrics.wakeups,
        metrics.coalesced_signals,
        metrics.plugin_failures,
        metrics.avg_processing_us
    );
    debug!("Recorded metrics:\n{}", metrics_handle.render());
    Ok(())
}
