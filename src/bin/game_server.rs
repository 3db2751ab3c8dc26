use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hearth::config::ServerConfig;
use hearth::game::{DataSaver, EventHook, MessageHandler, Player, World};
use hearth::network::Frame;
use hearth::session::Session;
use hearth::{GameHooks, GameServer};

/// Logs every frame and otherwise does nothing. Stands in for real content.
struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn on_message(&self, session: &Arc<Session>, frame: Frame) -> Result<()> {
        tracing::debug!(
            "[game] id={} cmd={} len={}",
            session.id(),
            frame.command(),
            frame.len()
        );
        Ok(())
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        tracing::debug!("[game] id={} disconnected", session.id());
    }
}

struct EmptyWorld;

impl World for EmptyWorld {
    fn update(&self, _delta: Duration) -> Result<()> {
        Ok(())
    }

    fn players(&self) -> Vec<Arc<dyn Player>> {
        Vec::new()
    }
}

impl EventHook for EmptyWorld {
    fn update(&self, _now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        Ok(())
    }
}

impl DataSaver for EmptyWorld {
    fn save_player_data(&self, _player: &dyn Player) -> Result<()> {
        Ok(())
    }

    fn save_global_data(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/server.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: game_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = if Path::new(&conf_file).exists() {
        ServerConfig::from_file(&conf_file)
            .with_context(|| format!("Cannot load config: {}", conf_file))?
    } else {
        tracing::warn!("[core] {} not found, using defaults", conf_file);
        ServerConfig::default()
    };

    let world = Arc::new(EmptyWorld);
    let hooks = GameHooks {
        handler: Arc::new(LoggingHandler),
        world: world.clone(),
        events: world.clone(),
        saver: world,
    };

    let game = GameServer::new(config, hooks)?;
    let addr = game.start().await?;
    tracing::info!("[core] [started] Game Server listening on {}", addr);

    game.run_until_signal().await?;
    Ok(())
}
