use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use server_clique::{
    broker::Broker,
    cli::{BrokerArgs, Cli, ClientArgs, Command, LogArgs, ServerArgs},
    error::ServerError,
    fileserver::FileServer,
    producer,
    queue::{Queue, TcpQueue},
    server::{self, Server},
    sink::ResultSink,
};

fn init_tracing(args: &LogArgs) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if args.debug_log { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if args.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
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
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
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

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let broker = Broker::new(listener);
    let addr = broker.local_addr()?;
    info!("broker listening on {}", addr);
    if let Err(err) = broker.run_until(shutdown_signal()).await {
        warn!("broker exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let queue = TcpQueue::connect(args.queue.queue_addr, args.queue.queue_name.clone())
        .await
        .map_err(ServerError::from)
        .context("failed to create queue")?;

    let sink = match ResultSink::open(&args.output_file).await {
        Ok(sink) => sink,
        Err(err) => {
            if let Err(close_err) = queue.close().await {
                warn!(error = ?close_err, "failed to close queue");
            }
            return Err(err).context("failed to open output file");
        }
    };

    let file_server = match args.file_server {
        Some(addr) => match FileServer::bind(addr, &args.output_file).await {
            Ok(file_server) => Some(file_server),
            Err(err) => {
                server::release(&queue, &sink).await;
                return Err(err).with_context(|| format!("failed to start file server on {addr}"));
            }
        },
        None => None,
    };

    let cancel = CancellationToken::new();
    let server = Server::new(queue, sink, args.server_config());
    let mut run = tokio::spawn(server.run(cancel.clone()));

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            warn!("shutting down server");
            if let Some(file_server) = file_server {
                file_server.stop().await;
            }
            cancel.cancel();
            run.await.context("server task failed")?
        }
        outcome = &mut run => {
            if let Some(file_server) = file_server {
                file_server.stop().await;
            }
            outcome.context("server task failed")?
        }
    };

    match outcome {
        Ok(report) => {
            info!(admitted = report.admitted, applied = report.applied, "server stopped");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "server stopped");
            Err(err.into())
        }
    }
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let commands = producer::load_commands(&args.input).await?;
    let queue = TcpQueue::connect(args.queue.queue_addr, args.queue.queue_name.clone())
        .await
        .context("failed to create queue")?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("shutting down client");
            cancel.cancel();
        })
    };

    let summary = producer::publish_all(&queue, &commands, &cancel).await;
    watcher.abort();
    if let Err(err) = queue.close().await {
        warn!(error = ?err, "failed to close queue");
    }

    if summary.aborted {
        anyhow::bail!(
            "publishing aborted after {} of {} commands",
            summary.published,
            commands.len()
        );
    }
    info!(
        published = summary.published,
        failed = summary.failed,
        "client sending data completed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.logging);

    match cli.command {
        Command::Broker(args) => run_broker(args).await,
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}
