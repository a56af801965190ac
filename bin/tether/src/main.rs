mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Keep an authenticated session to a web service and mirror its state", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Onboard {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration, paths and saved login
    Status,

    /// Launch the browser and log in
    Login {
        /// Account username; prompted when omitted
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Print every state change observed on the session's traffic
    Watch,

    /// Send a request through the authenticated transport
    Request {
        /// Absolute URL, or a path relative to the service origin
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Extra header as `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,

        /// Accept an event stream and print raw chunks as they arrive
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(force).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Login { username } => {
            commands::login::run(username).await?;
        }
        Commands::Watch => {
            commands::watch::run().await?;
        }
        Commands::Request {
            url,
            method,
            headers,
            body,
            stream,
        } => {
            commands::request::run(url, method, headers, body, stream).await?;
        }
    }

    Ok(())
}
