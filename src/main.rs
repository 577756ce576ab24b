use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wormpipe")]
#[command(about = "Send files and directories through an end-to-end encrypted wormhole", long_about = None)]
#[command(version)]
struct Cli {
    /// WebSocket URL of the rendezvous mailbox server
    #[arg(long, global = true, default_value = wormpipe::DEFAULT_MAILBOX_URL)]
    mailbox: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file or directory
    Send {
        /// Path to the file or directory to send
        path: String,
    },
    /// Receive a payload from a peer
    Receive {
        /// Wormhole code from the sender (prompted for if omitted)
        code: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match cli.command {
        Commands::Send { path } => wormpipe::commands::send::run(&cli.mailbox, &path).await,
        Commands::Receive { code } => wormpipe::commands::receive::run(&cli.mailbox, code).await,
    }
}
