//! pktscope - trace the pkt-line traffic of git smart-HTTP exchanges.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod commands;
mod logging;
mod settings;

use commands::{CliError, PrintSink};
use logging::{init_logging, level_for, LogFormat};
use settings::Settings;

/// pktscope - watch git smart-HTTP traffic frame by frame
#[derive(Parser, Debug)]
#[command(name = "pktscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch and trace a remote's ref advertisement
    Probe {
        /// Repository URL, e.g. https://github.com/owner/repo.git
        url: String,
        /// Service to advertise
        #[arg(short, long, default_value = "git-upload-pack")]
        service: String,
        /// Request protocol version 2
        #[arg(long)]
        protocol_v2: bool,
    },

    /// POST a captured request body and trace both directions
    Replay {
        /// Repository URL
        url: String,
        /// File holding the pkt-line request body
        #[arg(short, long)]
        request: PathBuf,
        /// Service endpoint to post to
        #[arg(short, long, default_value = "git-upload-pack")]
        service: String,
    },

    /// Decode a captured pkt-line stream from a file or stdin
    Decode {
        /// Capture file; reads stdin when omitted or `-`
        input: Option<PathBuf>,
        /// Tag to print the trace under
        #[arg(short, long, default_value = "capture")]
        tag: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::parse(&settings.log_format)
    };
    init_logging(level_for(cli.verbose, &settings.log_level), format);

    if let Err(e) = run(cli.command, &settings).await {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, settings: &Settings) -> Result<(), CliError> {
    match command {
        Commands::Probe {
            url,
            service,
            protocol_v2,
        } => {
            let transport = commands::build_transport(&settings.observer)?;
            let exchange = commands::probe(transport, &url, &service, protocol_v2).await?;
            println!("{} ({} bytes)", exchange.status, exchange.response_bytes);
        }
        Commands::Replay {
            url,
            request,
            service,
        } => {
            let transport = commands::build_transport(&settings.observer)?;
            let exchange = commands::replay(transport, &url, &service, &request).await?;
            println!("{} ({} bytes)", exchange.status, exchange.response_bytes);
        }
        Commands::Decode { input, tag } => {
            let reader = commands::open_input(input.as_deref())?;
            let sink = Arc::new(PrintSink::new(
                std::io::stdout(),
                settings.observer.payload_preview,
            ));
            let decoded = commands::decode(reader, sink, &tag)?;
            tracing::info!(bytes = decoded, "Decoded capture");
        }
        Commands::Version => {
            println!("pktscope {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
