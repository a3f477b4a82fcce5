use std::time::Duration;

use clap::Args;
use pooled_ws::{ConnectionPool, Data, Event, Executor, Options, WebSocket};
use rustyline::ExternalPrinter;
use tokio::{
    runtime,
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::timeout,
};

/// Connect to a WebSocket server and exchange messages interactively.
///
/// Both plaintext (ws://) and secure (wss://) URLs are supported. Typing `/close` closes
/// the connection normally.
#[derive(Args)]
#[command(alias = "c")]
pub struct Cmd {
    /// Maximum duration to wait for the handshake.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5s")]
    timeout: Duration,

    /// How often the connection is polled for incoming frames while idle.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "50ms")]
    tick: Duration,

    /// Subprotocol to offer. Can be repeated.
    #[arg(short, long = "protocol")]
    protocols: Vec<String>,

    /// Pretty-prints received text messages as JSON.
    #[arg(long)]
    input_as_json: bool,

    /// The WebSocket URL to connect to (ws:// or wss://)
    url: String,
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let history_path = home::home_dir()
        .ok_or(anyhow::anyhow!("unable to determine home path"))?
        .join(".wsc_history");

    let mut rl = rustyline::DefaultEditor::with_config(
        rustyline::Config::builder()
            .auto_add_history(true)
            .completion_type(rustyline::CompletionType::List)
            .max_history_size(1000)?
            .build(),
    )?;
    // a missing history file is fine
    let _ = rl.load_history(&history_path);
    let printer = rl.create_external_printer()?;

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let _guard = runtime.enter();

    let executor = Executor::new(runtime.handle().clone());
    let pool = ConnectionPool::new(executor.clone());
    let mut ws = WebSocket::with_options(
        pool.clone(),
        executor.clone(),
        Options::default().with_tick_interval(cmd.tick),
    );

    ws.open(&cmd.url, cmd.protocols.clone())?;
    runtime.block_on(timeout(cmd.timeout, wait_open(&mut ws)))??;

    match ws.protocol() {
        Some(protocol) => println!("> Connected to {} ({protocol})", cmd.url),
        None => println!("> Connected to {}", cmd.url),
    }

    let (tx, rx) = unbounded_channel();
    let opts = Opts {
        input_as_json: cmd.input_as_json,
    };

    runtime.spawn_blocking(move || loop {
        match rl.readline("> ") {
            Ok(mut line) => {
                let _ = rl.add_history_entry(line.as_str());
                if let Some(pos) = line.rfind("//") {
                    let _ = line.split_off(pos);
                }

                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => {
                if let Err(err) = rl.save_history(&history_path) {
                    eprintln!("unable to save history: {err}");
                }
                break;
            }
        }
    });
    runtime.block_on(handle_websocket(ws, rx, printer, opts));

    executor.terminate();
    pool.terminate();
    runtime.shutdown_background();

    Ok(())
}

struct Opts {
    input_as_json: bool,
}

async fn wait_open(ws: &mut WebSocket) -> anyhow::Result<()> {
    while let Some(event) = ws.next_event().await {
        match event {
            Event::Open => return Ok(()),
            Event::Error(err) => return Err(err.into()),
            _ => {}
        }
    }
    anyhow::bail!("connection closed during handshake")
}

async fn handle_websocket(
    mut ws: WebSocket,
    mut rx: UnboundedReceiver<String>,
    mut printer: impl ExternalPrinter,
    opts: Opts,
) {
    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else {
                    break;
                };

                let result = match line.trim() {
                    "/close" => ws.close(1000, ""),
                    _ => ws.send(line),
                };
                if let Err(err) = result {
                    let _ = printer.print(format!("unable to write: {err}"));
                }
            }
            event = ws.next_event() => {
                let Some(event) = event else {
                    let _ = printer.print("<Disconnected>".to_owned());
                    break;
                };

                match event {
                    Event::Message(Data::Text(text)) if opts.input_as_json => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(ok) => {
                                let _ = printer.print(format!("{:#}", ok));
                            }
                            Err(err) => {
                                let _ = printer.print(format!("parsing json: {err}"));
                            }
                        }
                    }
                    Event::Message(Data::Text(text)) => {
                        let _ = printer.print(text);
                    }
                    Event::Message(Data::Binary(bytes)) => {
                        let _ = printer.print(format!("<Binary {} bytes>", bytes.len()));
                    }
                    Event::Error(err) => {
                        let _ = printer.print(format!("<Error: {err}>"));
                    }
                    Event::Close => {
                        let _ = printer.print("<Closed>".to_owned());
                    }
                    Event::Open | Event::ReadyStateChange(_) => {}
                }
            }
        }
    }

    if ws.ready_state() != pooled_ws::ReadyState::Closed {
        let _ = ws.close(1000, "");
    }
}
