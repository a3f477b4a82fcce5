use clap::{Parser, Subcommand};

mod client;

/// Interactive WebSocket client.
///
/// Every line typed is sent as a text message; received messages are printed as they
/// arrive. Text after `//` on a line is a comment and is not sent, which makes messages
/// searchable with ctrl+r in the history.
///
/// Examples:
///   {"type": "ping"} // Heartbeat
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Log level for the library (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "warn")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Client(client::Cmd),
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = simple_logger::SimpleLogger::new()
        .with_level(args.log_level)
        .init()
    {
        eprintln!("unable to install logger: {err}");
    }

    let res = match args.command {
        Commands::Client(cmd) => client::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
