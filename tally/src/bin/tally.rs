use std::{path::PathBuf, sync::Arc, time::SystemTime};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tally::{
    config::Config,
    dispatch,
    exporter::{HttpExporter, Sink},
    processor::{self, Options, StatsProcessor},
    record::Record,
    tid::{Environment, StaticEnvironment},
};
use tally_buffer::FilesystemBuffer;
use tokio::{
    fs,
    io::{self, AsyncBufRead, AsyncBufReadExt, BufReader},
    runtime::Builder,
    signal,
    time,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Failed to load tally config: {0}")]
    Config(#[from] tally::config::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Stats processor returned an error: {0}")]
    Processor(#[from] processor::Error),
    #[error("Failed to build exporter: {0}")]
    Exporter(#[from] tally::exporter::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/tally/tally.yaml".to_string()
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// JSON-lines file of records to process, `-` for stdin
    #[clap(long, default_value = "-")]
    input: String,
}

async fn reader(input: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, Error> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = fs::File::open(input).await?;
    Ok(Box::new(BufReader::new(file)))
}

async fn inner_main(config: Config, input: &str) -> Result<(), Error> {
    if let Some(telemetry) = config.telemetry {
        PrometheusBuilder::new()
            .with_http_listener(telemetry.prometheus_addr)
            .install()?;
        info!(addr = %telemetry.prometheus_addr, "prometheus exporter listening");
    }

    fs::create_dir_all(&config.buffer.directory).await?;
    let buffer = FilesystemBuffer::new(&config.buffer.directory);

    let sink: Arc<dyn Sink> = Arc::new(HttpExporter::new(
        config.exporter.endpoint.clone(),
        config.exporter.timeout(),
    )?);
    let (dispatcher, worker) = dispatch::queue(
        sink,
        config.exporter.queue_capacity.get(),
        config.exporter.workers,
    );
    let worker = tokio::spawn(worker.run());

    let environment: Arc<dyn Environment> =
        Arc::new(StaticEnvironment::new(config.environment.tags.clone()));
    let processor = StatsProcessor::new(
        Options::from(&config),
        buffer,
        dispatcher,
        Some(environment),
    )?;

    let mut lines = reader(input).await?.lines();
    let mut ticker = time::interval(config.idle_flush());
    let mut processed: u64 = 0;
    let res = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let record: Record = match serde_json::from_str(&line) {
                            Ok(record) => record,
                            Err(err) => {
                                warn!(%err, "skipping malformed record");
                                continue;
                            }
                        };
                        if let Err(err) = processor.process(SystemTime::now(), &[record]) {
                            error!(%err, "processing failed");
                            break Err(Error::from(err));
                        }
                        processed += 1;
                    }
                    Ok(None) => {
                        info!(processed, "input exhausted");
                        break Ok(());
                    }
                    Err(err) => {
                        error!(%err, "failed to read input");
                        break Err(Error::from(err));
                    }
                }
            }
            _ = ticker.tick() => {
                let now = SystemTime::now();
                if let Err(err) = processor.tick(now) {
                    error!(%err, "forced rollover failed");
                    break Err(Error::from(err));
                }
                match processor.emit_aggregations(now) {
                    Ok(windows) => {
                        for window in windows {
                            for (series, aggregation) in &window.aggregations {
                                info!(
                                    window_start = window.window_start,
                                    series,
                                    name = aggregation.name(),
                                    kind = %aggregation.aggregation_type(),
                                    count = aggregation.count(),
                                    value = ?aggregation.value(),
                                    "aggregation closed"
                                );
                            }
                        }
                    }
                    Err(err) => warn!(%err, "failed to emit aggregations"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            }
        }
    };

    info!("shutting down, draining open windows");
    let shutdown = processor.shutdown(SystemTime::now());
    if let Err(err) = worker.await {
        error!("Could not join the dispatch worker: {err}");
    }
    debug!("dispatch worker finished");
    res?;
    shutdown?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tally {version}.");

    let args = Args::parse();
    let config = Config::from_path(&PathBuf::from(&args.config_path))?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, &args.input));
    info!("Bye. :)");
    res
}
