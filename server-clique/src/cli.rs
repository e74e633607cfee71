use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{server::ServerConfig, table::ListOrder};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LogArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, env = "DEBUG_LOG", global = true)]
    pub debug_log: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the local message broker.
    Broker(BrokerArgs),
    /// Consume commands from the broker and apply them to the in-memory table.
    Server(ServerArgs),
    /// Publish the commands from an input file to the broker.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct QueueArgs {
    /// Address of the broker.
    #[arg(long, env = "QUEUE_ADDR", default_value = "127.0.0.1:5672")]
    pub queue_addr: SocketAddr,

    /// Name of the queue carrying commands.
    #[arg(long, env = "QUEUE_NAME", default_value = "rabbit-queue")]
    pub queue_name: String,
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use 0 for an ephemeral port.
    #[arg(long, env = "BROKER_LISTEN", default_value = "127.0.0.1:5672")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// File every result record is appended to.
    #[arg(long, env = "OUTPUT_FILE_NAME", default_value = "output.json")]
    pub output_file: PathBuf,

    /// Number of workers applying commands.
    #[arg(
        long,
        env = "WORKER_POOL_SIZE",
        default_value_t = 5,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: u16,

    /// Capacity of the dispatch pipe; defaults to the number of workers.
    #[arg(long, env = "PIPE_CAPACITY", value_parser = clap::value_parser!(u16).range(1..))]
    pub pipe_capacity: Option<u16>,

    /// Order in which getall lists entries.
    #[arg(long, env = "LIST_ORDER", value_enum, default_value_t = ListOrder::Slot)]
    pub list_order: ListOrder,

    /// Serve the output directory over HTTP on this address.
    #[arg(long, env = "FILE_SERVER_LISTEN_ADDRESS")]
    pub file_server: Option<SocketAddr>,
}

impl ServerArgs {
    pub fn server_config(&self) -> ServerConfig {
        let workers = usize::from(self.workers);
        ServerConfig {
            workers,
            pipe_capacity: self.pipe_capacity.map(usize::from).unwrap_or(workers),
            list_order: self.list_order,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// JSON array of commands to publish.
    #[arg(long, env = "INPUT_FILE", default_value = "input.json")]
    pub input: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_capacity_defaults_to_worker_count() {
        let cli = Cli::try_parse_from(["server-clique", "server", "--workers", "3"])
            .expect("parse server args");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(
            args.server_config(),
            ServerConfig {
                workers: 3,
                pipe_capacity: 3,
                list_order: ListOrder::Slot,
            }
        );
    }

    #[test]
    fn rejects_an_empty_pool() {
        let result = Cli::try_parse_from(["server-clique", "server", "--workers", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_list_order_and_viewer() {
        let cli = Cli::try_parse_from([
            "server-clique",
            "--log-json",
            "server",
            "--list-order",
            "timestamp",
            "--pipe-capacity",
            "16",
            "--file-server",
            "127.0.0.1:8080",
        ])
        .expect("parse server args");
        assert!(cli.logging.log_json);
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = args.server_config();
        assert_eq!(config.list_order, ListOrder::Timestamp);
        assert_eq!(config.pipe_capacity, 16);
        assert_eq!(args.file_server, Some("127.0.0.1:8080".parse().unwrap()));
    }
}
