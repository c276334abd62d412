// Chatlink terminal peer: `chatlink listen` sends files, `chatlink dial` chats.

mod config;
mod console;

use std::sync::Arc;

use anyhow::{bail, Context};
use chatlink_core::codec::validate_sender;
use chatlink_core::{Role, Session, SessionConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: chatlink <listen|dial> [--version]";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut role = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("{}", version_line());
                return Ok(());
            }
            "listen" | "dial" => role = Some(arg),
            other => bail!("unknown argument '{}'\n{}", other, USAGE),
        }
    }
    let Some(role) = role else {
        bail!(USAGE);
    };

    let cfg = config::load();
    let mut session_config = if role == "listen" {
        SessionConfig::listener()
    } else {
        let username = match cfg.username {
            Some(name) => {
                validate_sender(&name).context("configured username")?;
                name
            }
            None => console::prompt_username()?.context("no username given")?,
        };
        std::fs::create_dir_all(&cfg.download_dir).with_context(|| {
            format!("creating download dir {}", cfg.download_dir.display())
        })?;
        SessionConfig::dialer(username)
    };
    session_config.port = cfg.port;
    session_config.download_dir = cfg.download_dir;
    log::debug!("starting {:?} on port {}", session_config.role, session_config.port);
    if matches!(session_config.role, Role::Listener) {
        println!("Type a file path to send it once a peer connects, or 'exit'.");
    }

    let session = Session::new(session_config, Arc::new(console::Console))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let input_session = session.clone();
        std::thread::Builder::new()
            .name("chatlink-input".into())
            .spawn(move || {
                let mut input = console::StdinInput::new(input_session.clone());
                let _ = done_tx.send(chatlink_core::run(&input_session, &mut input));
            })?;
        tokio::select! {
            finished = done_rx => {
                if let Ok(result) = finished {
                    result?;
                }
            }
            signal = shutdown_signal() => signal?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    session.shutdown();
    println!("Exiting...");
    Ok(())
}

fn version_line() -> String {
    format!(
        "chatlink {} (protocol v{})",
        VERSION,
        chatlink_core::PROTOCOL_VERSION
    )
}

/// Wait for Ctrl+C or SIGTERM (Unix). Either one ends the session like `exit`.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_names_the_wire_protocol() {
        let line = version_line();
        assert!(line.starts_with("chatlink "));
        assert!(line.ends_with("(protocol v1)"));
    }
}
