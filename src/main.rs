use chatflow::{
    channel::{LineGateway, pump_events},
    config::{ConfigManager, EnvConfigManager, RuntimeConfig},
    flow::{NodeDispatcher, SessionRegistry},
    graph::Graph,
    logger::init_tracing,
    schema::write_schema,
    service::ReqwestServiceClient,
};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process, sync::Arc};
use tokio::io::BufReader;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "chatflow",
    about = "Runs conversation flows for a messaging platform",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read events from stdin, write commands to stdout
    Run(RunArgs),

    /// Check a graph file and print a summary
    Validate { file: PathBuf },

    /// Emit JSON-Schema for graphs and wire messages
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Graph file, overrides CHATFLOW_GRAPH
    #[arg(long)]
    graph: Option<PathBuf>,

    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { file } => match Graph::load(&file) {
            Ok(graph) => {
                println!(
                    "{}: {} nodes, start `{}` on {:?}, {} variables",
                    file.display(),
                    graph.len(),
                    graph.start_id(),
                    graph.trigger(),
                    graph.variables().len()
                );
                Ok(())
            }
            Err(err) => {
                eprintln!("{}: {err}", file.display());
                process::exit(1);
            }
        },
        Commands::Schema(args) => {
            for path in write_schema(&args.out)? {
                println!("wrote {}", path.display());
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = ConfigManager(EnvConfigManager::new(args.env_file));
    let mut runtime = RuntimeConfig::from_manager(&config).await?;
    if let Some(graph) = args.graph {
        runtime.graph_path = Some(graph);
        runtime.graph_json = None;
    }
    if let Some(level) = args.log_level {
        runtime.log_level = level;
    }
    if let Some(dir) = args.log_dir {
        runtime.log_dir = Some(dir);
    }

    let _guards = init_tracing(&runtime.log_config())?;

    let graph = match runtime.load_graph() {
        Ok(graph) => Arc::new(graph),
        Err(err) => {
            error!(error = %err, "could not load graph");
            return Err(err.into());
        }
    };
    info!(nodes = graph.len(), trigger = ?graph.trigger(), "graph loaded");

    let gateway = Arc::new(LineGateway::new(tokio::io::stdout()));
    let services = Arc::new(ReqwestServiceClient::new(runtime.http_timeout)?);
    let dispatcher =
        Arc::new(NodeDispatcher::new(graph, gateway, services).with_continuation(runtime.continuation));
    let registry = SessionRegistry::with_agent(dispatcher, runtime.agent_id);

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        pumped = pump_events(&registry, stdin) => {
            let accepted = pumped?;
            info!(accepted, "input closed, finishing queued work");
            registry.settled().await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    let dropped = registry.shutdown();
    info!(sessions = dropped, "stopped");
    Ok(())
}
