//! Terminal peer for a collaborative military parade session.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run two peers on one machine with
//! `cargo run -p parade-peer -- --name Alpha --listen 127.0.0.1:7878 --host-only` and
//! `cargo run -p parade-peer -- --name Bravo --seed 127.0.0.1:7878 --browse-only`.

mod input;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use parade_config::{CliArgs, Config};
use parade_net::{FrameConfig, PeerId, TcpConfig, TcpTransport, Transform};
use parade_session::{
    AllowList, ChatConfig, Notification, SessionController, SessionError, SessionHandle,
    SessionRuntime,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::input::{HELP, Input, parse_line};

fn tcp_config(config: &Config) -> TcpConfig {
    TcpConfig {
        listen_addr: config.network.listen_addr,
        seeds: config.network.seeds.clone(),
        service: config.session.service_type.clone(),
        frame: FrameConfig {
            max_payload_size: config.network.max_payload_size,
        },
        invite_timeout: Duration::from_secs(config.session.invite_timeout_secs),
        handshake_timeout: Duration::from_secs(config.network.handshake_timeout_secs),
    }
}

fn controller(config: &Config, transport: TcpTransport) -> SessionController<TcpTransport> {
    if config.session.auto_accept_invites {
        return SessionController::new(transport);
    }
    let allowed = config
        .session
        .allowed_peers
        .iter()
        .filter_map(|name| match PeerId::new(name.as_str()) {
            Ok(peer) => Some(peer),
            Err(e) => {
                warn!("Ignoring allowed peer {name:?}: {e}");
                None
            }
        });
    SessionController::with_policy(transport, AllowList::new(allowed))
}

fn render(notification: &Notification) -> String {
    match notification {
        Notification::PeerJoined(peer) => format!("* {peer} joined"),
        Notification::PeerLeft(peer) => format!("* {peer} left"),
        Notification::DecodeError {
            peer,
            reason,
            count,
        } => format!("! dropped message #{count} from {peer}: {reason}"),
        Notification::TransportError { operation, reason } => {
            format!("! {operation} failed: {reason}")
        }
        Notification::EntityApplied {
            entity_id,
            transform,
        } => format!(
            "* {entity_id} at {:?} scale {:?}",
            transform.position, transform.scale
        ),
        Notification::EntityRemoved { entity_id } => format!("* {entity_id} removed"),
        Notification::EntitySelected { entity_id, by } => format!("* {by} selected {entity_id}"),
        Notification::PerspectiveRequested { perspective, by } => {
            format!("* {by} switched the view to {perspective}")
        }
        Notification::ParadeControlRequested { action, phase, by } => {
            format!("* {by} sent {action}, parade now in {phase}")
        }
        Notification::ChatReceived { sender, text } => format!("<{sender}> {text}"),
    }
}

/// Apply one line of input. Returns `false` once the peer should exit.
async fn execute(handle: &SessionHandle, input: Input) -> Result<bool, SessionError> {
    match input {
        Input::Chat(text) => handle.send_chat(&text)?,
        Input::View(perspective) => handle.change_perspective(perspective)?,
        Input::Parade(action) => handle.send_parade_control(action)?,
        Input::Entity {
            id,
            action,
            position,
            scale,
        } => {
            let mut transform = handle
                .entity(id.as_str())
                .await?
                .map(|state| state.transform)
                .unwrap_or_default();
            if let Some(position) = position {
                transform.position = position;
            }
            if let Some(factor) = scale {
                transform.scale = Transform::default().scale * factor;
            }
            handle.broadcast_entity_update(id, action, transform)?;
        }
        Input::ShowEntity(id) => match handle.entity(id.as_str()).await? {
            Some(state) => println!(
                "{id}: position {:?} rotation {:?} scale {:?} (t={})",
                state.transform.position,
                state.transform.rotation,
                state.transform.scale,
                state.timestamp
            ),
            None => println!("{id}: not in the scene"),
        },
        Input::Peers => {
            let peers = handle.peers().await?;
            if peers.is_empty() {
                println!("no linked peers ({:?})", handle.state());
            }
            for peer in peers {
                println!("  {peer}");
            }
        }
        Input::Log => {
            for entry in handle.chat_log().await? {
                println!("[{}] <{}> {}", entry.timestamp, entry.sender, entry.text);
            }
            let (perspective, parade) = handle.stage().await?;
            if let Some(perspective) = perspective {
                println!("view: {perspective}");
            }
            println!("parade: {} (playing: {})", parade.phase, parade.playing);
        }
        Input::Leave => handle.stop()?,
        Input::Quit => return Ok(false),
        Input::Help => println!("{HELP}"),
    }
    Ok(true)
}

async fn run(args: &CliArgs, config: &Config) -> Result<(), SessionError> {
    let local = PeerId::local(config.session.display_name.as_deref());
    let (transport, events) = TcpTransport::new(local.clone(), tcp_config(config));
    let chat = ChatConfig {
        max_message_length: config.session.max_chat_length,
    };
    let (runtime, handle, mut notifications) =
        SessionRuntime::new(controller(config, transport), events, chat);
    let runtime = tokio::spawn(runtime.run());

    info!("Joining '{}' as {local}", config.session.service_type);
    if !args.browse_only {
        handle.start_hosting()?;
    }
    if !args.host_only {
        handle.start_browsing()?;
    }
    println!("{local} ready, /help lists commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => println!("{}", render(&notification)),
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin closed: {e}");
                        break;
                    }
                };
                match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(input)) => match execute(&handle, input).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(SessionError::Closed) => return Err(SessionError::Closed),
                        Err(e) => println!("! {e}"),
                    },
                    Err(e) => println!("! {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown()?;
    if let Err(e) = runtime.await {
        warn!("Session runtime panicked: {e}");
    }
    while let Ok(notification) = notifications.try_recv() {
        println!("{}", render(&notification));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map(Ok).unwrap_or_else(Config::default_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    parade_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    match run(&args, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Session ended with an error: {e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_from_file_settings() {
        let mut config = Config::default();
        config.session.service_type = "rehearsal".into();
        config.session.invite_timeout_secs = 3;
        config.network.max_payload_size = 4096;
        config.network.seeds = vec!["10.0.0.2:7878".parse().unwrap()];

        let tcp = tcp_config(&config);
        assert_eq!(tcp.service, "rehearsal");
        assert_eq!(tcp.invite_timeout, Duration::from_secs(3));
        assert_eq!(tcp.frame.max_payload_size, 4096);
        assert_eq!(tcp.seeds, config.network.seeds);
        assert_eq!(tcp.listen_addr.port(), 7878);
    }

    #[test]
    fn test_render_chat_and_parade() {
        let alpha = PeerId::new("Alpha").unwrap();
        assert_eq!(
            render(&Notification::ChatReceived {
                sender: alpha.clone(),
                text: "eyes right".into()
            }),
            "<Alpha> eyes right"
        );
        let line = render(&Notification::ParadeControlRequested {
            action: parade_net::ParadeAction::Start,
            phase: parade_session::ParadePhase::MarchingBegins,
            by: alpha,
        });
        assert!(line.starts_with("* Alpha sent Start"));
    }
}
