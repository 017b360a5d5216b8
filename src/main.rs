use std::{
    io::{self, BufRead},
    sync::mpsc,
    thread,
    time::UNIX_EPOCH,
};

use clap::Parser;
use edd_notify::{Channel, ClientConfig, Message, Snapshot, TransportEvent};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edd-notify")]
#[command(about = "Terminal client for the notification channel")]
struct Cli {
    /// Page origin the endpoint is derived from (e.g. https://edd.example.org)
    #[arg(long)]
    origin: Option<String>,

    /// Endpoint path relative to the origin
    #[arg(long)]
    path: Option<String>,

    /// Announce newly arriving messages with this tag (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
}

enum Input {
    Transport(TransportEvent),
    Line(String),
    Eof,
}

enum UserCommand {
    Read(String),
    ReadAll,
    List,
    Quit,
}

fn parse_command(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    match (parts.next()?, parts.next()) {
        ("read", Some(uuid)) => Some(UserCommand::Read(uuid.to_string())),
        ("read-all", None) => Some(UserCommand::ReadAll),
        ("list", None) => Some(UserCommand::List),
        ("quit" | "exit", None) => Some(UserCommand::Quit),
        _ => None,
    }
}

fn format_time(message: &Message) -> String {
    let secs = message
        .time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let hours = (secs / 3600) % 24;
    let minutes = (secs / 60) % 60;
    format!("{:02}:{:02}", hours, minutes)
}

fn render(snapshot: &Snapshot) {
    if snapshot.unread == 0 {
        println!("-- no unread notifications");
    } else {
        println!("-- {} unread", snapshot.unread);
    }
    for message in &snapshot.messages {
        println!(
            "   [{}] {} {}",
            message.uuid,
            format_time(message),
            message.text
        );
    }
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(origin) = cli.origin {
        config.origin = origin;
    }
    if let Some(path) = cli.path {
        config.path = path;
    }

    let (mut channel, events) = match Channel::connect(&config) {
        Ok(pair) => pair,
        Err(err) => {
            error!("invalid notification endpoint: {err}");
            std::process::exit(1);
        }
    };

    channel.subscribe(render);
    for tag in cli.tags {
        let label = tag.clone();
        channel.add_tag_action(tag, move |message: &Message| {
            println!("** [{label}] {}", message.text);
        });
    }

    let (input_tx, input_rx) = mpsc::channel::<Input>();
    {
        let input_tx = input_tx.clone();
        thread::spawn(move || {
            for event in events {
                if input_tx.send(Input::Transport(event)).is_err() {
                    break;
                }
            }
        });
    }
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if input_tx.send(Input::Line(line)).is_err() {
                return;
            }
        }
        let _ = input_tx.send(Input::Eof);
    });

    info!("edd-notify: waiting for notifications");
    for input in input_rx {
        match input {
            Input::Transport(event) => channel.handle_event(event),
            Input::Line(line) => match parse_command(&line) {
                Some(UserCommand::Read(uuid)) => channel.mark_read(&uuid),
                Some(UserCommand::ReadAll) => channel.mark_all_read(),
                Some(UserCommand::List) => render(&channel.snapshot()),
                Some(UserCommand::Quit) => break,
                None if line.trim().is_empty() => {}
                None => eprintln!("commands: read <id> | read-all | list | quit"),
            },
            Input::Eof => break,
        }
    }

    channel.shutdown();
}
