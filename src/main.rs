use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use queue_chain::chain::{ChainOutcome, ProcessorChain};
use queue_chain::config::{Config, LogFormat};
use queue_chain::messaging::{AmqpBroker, Transport};
use queue_chain::metrics::{Metrics, server::start_metrics_server};
use queue_chain::runner::{QueueRunner, process_file};
use queue_chain::steps::{self, CATALOG};

#[derive(Parser)]
#[command(name = "queue-chain", version, about = "Consume JSON messages, run them through a processor chain, publish the results")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the input queue until interrupted (default)
    Run,
    /// Run the configured chain over one JSON file
    ProcessFile {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// List the stock steps usable in CHAIN_STEPS
    Steps,
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    if let Command::Steps = command {
        for (name, description) in CATALOG {
            println!("{name:<16} {description}");
        }
        return;
    }

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = setup_logging(&config) {
        eprintln!("Failed to initialise logging: {}", e);
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        "queue-chain starting"
    );

    let chain = match steps::build_chain(
        &config.chain.name,
        &config.chain.steps,
        config.chain.step_timeout,
    ) {
        Ok(chain) => chain,
        Err(e) => {
            error!(error = %e, "Invalid chain configuration");
            std::process::exit(1);
        }
    };
    info!(chain = %chain, "Processor chain ready");

    let code = match command {
        Command::ProcessFile { input, output } => run_file(&chain, &input, &output).await,
        _ => run_consumer(config, chain).await,
    };

    std::process::exit(code);
}

async fn run_consumer(config: Config, chain: ProcessorChain) -> i32 {
    let uri = match config.broker.amqp_uri() {
        Ok(uri) => uri,
        Err(e) => {
            error!(error = %e, "Invalid broker configuration");
            return 1;
        }
    };

    let broker = Arc::new(AmqpBroker::new(uri, config.broker.redacted_endpoint()));
    let transport = Transport::new(broker, config.transport.clone());
    let mut runner = QueueRunner::new(transport, Arc::new(chain), config.runner.clone());

    if let Some(port) = config.metrics_port {
        let metrics = match Metrics::new() {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(error = %e, "Failed to create metrics");
                return 1;
            }
        };

        metrics.track_transport(runner.transport().watch_state());

        let server_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(server_metrics, port).await {
                error!(error = %e, "Metrics server error");
            }
        });

        runner = runner.with_report_sink(metrics);
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Shutdown signal received, cleaning up...");
        signal_token.cancel();
    });

    info!(
        input_queue = %config.transport.input_queue,
        "Ready to process messages"
    );

    match runner.run(shutdown).await {
        Ok(()) => {
            info!("queue-chain stopped");
            0
        }
        Err(e) => {
            error!(error = %e, "Queue runner failed");
            1
        }
    }
}

async fn run_file(chain: &ProcessorChain, input: &Path, output: &Path) -> i32 {
    let result = match process_file(chain, input, output).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "File processing failed");
            return 1;
        }
    };

    match &result.outcome {
        ChainOutcome::Completed(_) => {
            info!(
                output = %output.display(),
                elapsed_ms = result.total_duration().as_secs_f64() * 1000.0,
                "File processed"
            );
            0
        }
        ChainOutcome::Dropped { step } => {
            warn!(step = %step, "Message dropped, no output written");
            2
        }
        ChainOutcome::Failed { step, cause, .. } => {
            error!(step = %step, error = %cause, "Chain failed, no output written");
            1
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
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
}

fn setup_logging(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.rust_log)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(panic = message, location = %location, "Panic");
        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
