use anyhow::{Context, Result};
use clap::Parser;
use peercall_lib::commands::{CommandError, UserCommand, HELP};
use peercall_lib::logger;
use peercall_lib::media::SyntheticMediaSource;
use peercall_lib::messenger::Sender;
use peercall_lib::peer::{RoomId, RtcConnectionFactory};
use peercall_lib::relay::WsRelay;
use peercall_lib::{CallEvent, Client, ClientConfig, ClientHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "peercall")]
#[command(about = "Two-party call with chat over a signaling relay")]
struct Cli {
    #[arg(long, value_name = "ROOM", help = "Room to join")]
    room: String,
    #[arg(long, value_name = "EMAIL", help = "Identity shown to the other participant")]
    email: String,
    #[arg(long, env = "PEERCALL_CONFIG", value_name = "PATH", help = "TOML config file")]
    config: Option<PathBuf>,
    #[arg(long, env = "PEERCALL_RELAY", value_name = "URL", help = "Override relay endpoint")]
    relay_url: Option<String>,
    #[arg(
        long,
        env = "PEERCALL_LOG",
        value_name = "FILTER",
        help = "tracing filter, e.g. peercall_lib=debug"
    )]
    log: Option<String>,
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = &cli.relay_url {
        config.relay_url = url.clone();
    }
    if let Some(filter) = &cli.log {
        config.log_filter = Some(filter.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::Chat { message } => {
            let who = match message.sender {
                Sender::Local => "me",
                Sender::Remote => "peer",
            };
            println!("[{who}] {}", message.text);
        }
        CallEvent::Error { message } => eprintln!("error: {message}"),
        CallEvent::Warning { message } => eprintln!("warning: {message}"),
        other => match serde_json::to_string(other) {
            Ok(json) => println!("* {json}"),
            Err(e) => eprintln!("cannot print event: {e}"),
        },
    }
}

/// `false` когда пора выходить
async fn execute(handle: &ClientHandle, command: UserCommand) -> Result<bool> {
    match command {
        UserCommand::Call => {
            if let Err(e) = handle.initiate_call().await {
                eprintln!("call failed: {e}");
            }
        }
        UserCommand::Mute => {
            let mute = handle.toggle_audio().await?;
            println!("microphone {}", if mute.audio_muted { "muted" } else { "on" });
        }
        UserCommand::Hold => {
            let mute = handle.toggle_video().await?;
            println!("camera {}", if mute.video_on_hold { "on hold" } else { "on" });
        }
        UserCommand::End => {
            if !handle.end_call().await? {
                println!("no call to end");
            }
        }
        UserCommand::State => {
            let snapshot = handle.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        UserCommand::Help => println!("{HELP}"),
        UserCommand::Quit => return Ok(false),
        UserCommand::Chat(text) => {
            if let Err(e) = handle.send_chat(&text).await {
                eprintln!("not sent: {e}");
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logger::init(config.log_filter.as_deref());

    let relay = WsRelay::connect(&config.relay_url, config.join_timeout())
        .await
        .with_context(|| format!("cannot reach relay at {}", config.relay_url))?;
    let factory = Arc::new(RtcConnectionFactory::new(config.ice_servers.clone()));
    let mut client = Client::new(&config, relay, factory, Arc::new(SyntheticMediaSource));
    client.events().subscribe(Arc::new(|event: &CallEvent| print_event(event)));

    let id = client
        .join(RoomId::new(cli.room.clone()), &cli.email)
        .await
        .with_context(|| format!("cannot join room {}", cli.room))?;
    println!("joined {} as {id}, type /help for commands", cli.room);

    let handle = client.handle();
    let runner = tokio::spawn(client.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let command = match line.parse::<UserCommand>() {
            Ok(command) => command,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        if !execute(&handle, command).await? {
            break;
        }
    }

    handle.quit().await?;
    runner.await?;
    Ok(())
}
