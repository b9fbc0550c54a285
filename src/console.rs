//! Line-oriented operator console
//!
//! Reads commands from stdin and drives the [`PanelHandle`]. A second task
//! prints every [`PanelEvent`] as it arrives.

use crate::config::PanelConfig;
use crate::mqtt::codec::{Action, Target};
use crate::mqtt::transport::ChannelKind;
use crate::panel::events::PanelEvent;
use crate::panel::panel_handle::PanelHandle;
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const HELP: &str = "\
commands:
  connect [host port]      connect the active channel
  disconnect               disconnect the active channel
  channel local|cloud      select the active channel
  sub <topic>              subscribe topic of the active channel
  pub <topic>              publish topic of the active channel
  on|off|status <dev>|all  control one device or the whole fleet
  send <text>              publish raw text
  poll on|off              periodic status requests
  devices                  device table
  traffic                  recent traffic
  info                     active channel statistics
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    ConnectTo { host: String, port: u16 },
    Disconnect,
    Channel(ChannelKind),
    Subscribe(String),
    PublishTopic(String),
    Control { target: Target, action: Action },
    Send(String),
    Poll(bool),
    Devices,
    Traffic,
    Info,
    Help,
    Quit,
}

/// Parses one console line; blank lines yield `Ok(None)`
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "connect" if rest.is_empty() => ConsoleCommand::Connect,
        "connect" => {
            let mut parts = rest.split_whitespace();
            let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err("usage: connect [host port]".to_string());
            };
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {port}"))?;
            ConsoleCommand::ConnectTo {
                host: host.to_string(),
                port,
            }
        }
        "disconnect" => ConsoleCommand::Disconnect,
        "channel" => match rest.to_ascii_lowercase().as_str() {
            "local" => ConsoleCommand::Channel(ChannelKind::Local),
            "cloud" => ConsoleCommand::Channel(ChannelKind::Cloud),
            _ => return Err("usage: channel local|cloud".to_string()),
        },
        "sub" if !rest.is_empty() => ConsoleCommand::Subscribe(rest.to_string()),
        "pub" if !rest.is_empty() => ConsoleCommand::PublishTopic(rest.to_string()),
        "on" if !rest.is_empty() => control(rest, Action::On),
        "off" if !rest.is_empty() => control(rest, Action::Off),
        "status" if !rest.is_empty() => control(rest, Action::Status),
        "send" if !rest.is_empty() => ConsoleCommand::Send(rest.to_string()),
        "poll" => match rest.to_ascii_lowercase().as_str() {
            "on" => ConsoleCommand::Poll(true),
            "off" => ConsoleCommand::Poll(false),
            _ => return Err("usage: poll on|off".to_string()),
        },
        "devices" => ConsoleCommand::Devices,
        "traffic" => ConsoleCommand::Traffic,
        "info" => ConsoleCommand::Info,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        "sub" | "pub" | "on" | "off" | "status" | "send" => {
            return Err(format!("{word} needs an argument"));
        }
        _ => return Err(format!("unknown command: {word} (try help)")),
    };
    Ok(Some(command))
}

fn control(target: &str, action: Action) -> ConsoleCommand {
    ConsoleCommand::Control {
        target: Target::from(target),
        action,
    }
}

/// Prints panel events until the dispatcher closes the stream
pub fn spawn_event_printer(mut events: mpsc::Receiver<PanelEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                // Preview only, `traffic` prints full records
                PanelEvent::Traffic(record) => println!("  {}", record),
                other => println!("> {}", other),
            }
        }
        debug!("Event stream closed");
    })
}

/// Runs the console until `quit` or end of input
pub async fn run(handle: PanelHandle, config: &PanelConfig) -> Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| eyre!("Failed to read console input: {}", e))?
    {
        let command = match parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(&handle, config, command).await {
            warn!("Command failed: {}", e);
            println!("error: {e}");
        }
    }

    Ok(())
}

async fn execute(handle: &PanelHandle, config: &PanelConfig, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Connect => {
            let state = handle.connect().await?;
            println!("{} channel is {}", handle.active_channel().await?, state);
        }
        ConsoleCommand::ConnectTo { host, port } => {
            let channel = handle.active_channel().await?;
            let mut endpoint = config.channel(channel).endpoint();
            endpoint.host = host;
            endpoint.port = port;
            let state = handle.connect_to(endpoint).await?;
            println!("{} channel is {}", channel, state);
        }
        ConsoleCommand::Disconnect => {
            if !handle.disconnect().await? {
                println!("not connected");
            }
        }
        ConsoleCommand::Channel(kind) => handle.select_channel(kind).await?,
        ConsoleCommand::Subscribe(topic) => handle.set_subscribe_topic(topic).await?,
        ConsoleCommand::PublishTopic(topic) => handle.set_publish_topic(topic).await?,
        ConsoleCommand::Control { target, action } => match target {
            Target::All => handle.control_all(action).await?,
            Target::Device(device) => handle.control_device(&device, action).await?,
        },
        ConsoleCommand::Send(text) => handle.send_raw(text).await?,
        ConsoleCommand::Poll(true) => handle.start_polling().await?,
        ConsoleCommand::Poll(false) => handle.stop_polling().await?,
        ConsoleCommand::Devices => {
            for device in handle.devices().await? {
                println!(
                    "{:<12} {:<13} {}",
                    device.id,
                    device.status.to_string(),
                    device.state
                );
            }
        }
        ConsoleCommand::Traffic => {
            for record in handle.traffic().await? {
                println!("{}", record.render());
            }
        }
        ConsoleCommand::Info => {
            let channel = handle.active_channel().await?;
            let status = handle.channel_status(channel).await?;
            println!("channel:     {} ({})", channel, status.connection_state);
            println!(
                "subscribed:  {}",
                status.subscribed_topic.as_deref().unwrap_or("-")
            );
            if let Some(topic) = &status.pending_topic {
                println!("pending:     {topic}");
            }
            println!("publishing:  {}", status.publish_topic.as_deref().unwrap_or("-"));
            println!(
                "messages:    {} sent, {} received",
                status.messages_sent, status.messages_received
            );
            if let Some(at) = status.last_activity {
                println!("last active: {}", at.format("%H:%M:%S"));
            }
            for error in &status.error_messages {
                println!("error:       {error}");
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_and_broadcast_commands() {
        assert_eq!(
            parse("on ESP32-4"),
            Ok(Some(ConsoleCommand::Control {
                target: Target::Device("ESP32-4".into()),
                action: Action::On
            }))
        );
        assert_eq!(
            parse("  status all "),
            Ok(Some(ConsoleCommand::Control {
                target: Target::All,
                action: Action::Status
            }))
        );
        assert_eq!(
            parse("OFF ALL"),
            Ok(Some(ConsoleCommand::Control {
                target: Target::All,
                action: Action::Off
            }))
        );
    }

    #[test]
    fn send_keeps_the_text_verbatim() {
        assert_eq!(
            parse("send {\"a\": 1,  \"b\": 2}"),
            Ok(Some(ConsoleCommand::Send("{\"a\": 1,  \"b\": 2}".into())))
        );
    }

    #[test]
    fn connect_variants() {
        assert_eq!(parse("connect"), Ok(Some(ConsoleCommand::Connect)));
        assert_eq!(
            parse("connect 10.0.0.5 1884"),
            Ok(Some(ConsoleCommand::ConnectTo {
                host: "10.0.0.5".into(),
                port: 1884
            }))
        );
        assert!(parse("connect 10.0.0.5").is_err());
        assert!(parse("connect 10.0.0.5 99999").is_err());
    }

    #[test]
    fn channel_and_poll_switches() {
        assert_eq!(
            parse("channel cloud"),
            Ok(Some(ConsoleCommand::Channel(ChannelKind::Cloud)))
        );
        assert_eq!(parse("poll on"), Ok(Some(ConsoleCommand::Poll(true))));
        assert_eq!(parse("poll off"), Ok(Some(ConsoleCommand::Poll(false))));
        assert!(parse("channel mars").is_err());
        assert!(parse("poll maybe").is_err());
    }

    #[test]
    fn missing_arguments_and_noise() {
        assert_eq!(parse("   "), Ok(None));
        assert!(parse("sub").is_err());
        assert!(parse("on").is_err());
        assert!(parse("launch").is_err());
        assert_eq!(
            parse("sub fleet/+/status"),
            Ok(Some(ConsoleCommand::Subscribe("fleet/+/status".into())))
        );
    }
}
