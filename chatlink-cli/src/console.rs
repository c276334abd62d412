//! Terminal side of a peer: prints session events, reads commands from stdin.

use std::io::{self, BufRead, Write};

use chatlink_core::codec::validate_sender;
use chatlink_core::{
    ConnectionState, Direction, EventSink, Role, Session, SessionEvent, UserInput,
};

/// Prints every session event to the terminal.
pub struct Console;

impl EventSink for Console {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Listening { port } => {
                println!("Waiting for a peer to connect on port {}...", port)
            }
            SessionEvent::Connected { peer } => println!("Connected to {}", peer),
            SessionEvent::Disconnected { peer, lost: true } => {
                println!("LOST CONNECTION TO '{}'", peer.to_uppercase())
            }
            SessionEvent::Disconnected { peer, lost: false } => {
                println!("Disconnected from {}", peer)
            }
            SessionEvent::Message { peer, frame } => {
                println!("{} ({}) says: {}", frame.sender, peer, frame.body)
            }
            SessionEvent::TransferStarted {
                direction,
                file_name,
                total_bytes,
            } => println!("{} {} ({} bytes)", verb(direction), file_name, total_bytes),
            SessionEvent::Progress {
                direction,
                file_name,
                progress,
            } => {
                print!(
                    "\r{} {}: {}%",
                    verb(direction),
                    file_name,
                    progress.percent()
                );
                let _ = io::stdout().flush();
            }
            SessionEvent::TransferComplete { path, .. } => {
                println!("\nTransfer complete: {}", path.display())
            }
            SessionEvent::TransferFailed { file_name, reason } => match file_name {
                Some(name) => println!("\nTransfer of {} failed: {}", name, reason),
                None => println!("\nTransfer failed: {}", reason),
            },
            SessionEvent::NotConnected => {
                println!("No peer is connected yet, wait or type 'exit' to quit")
            }
            SessionEvent::CommandFailed { reason } => println!("Error: {}", reason),
            SessionEvent::ListenFailed { reason } => println!("Cannot accept peers: {}", reason),
        }
    }
}

fn verb(direction: Direction) -> &'static str {
    match direction {
        Direction::Outgoing => "Sending",
        Direction::Incoming => "Receiving",
    }
}

fn prompt(role: &Role, state: ConnectionState) -> &'static str {
    match (role, state) {
        (Role::Dialer { .. }, ConnectionState::Disconnected) => {
            "Host to connect to (or exit to quit): "
        }
        _ => "> ",
    }
}

/// Reads one command per line from stdin, prompting according to the session state.
pub struct StdinInput {
    session: Session,
    lines: io::Lines<io::StdinLock<'static>>,
}

impl StdinInput {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            lines: io::stdin().lines(),
        }
    }
}

impl UserInput for StdinInput {
    fn next_command(&mut self) -> Option<String> {
        print!("{}", prompt(self.session.role(), self.session.state()));
        let _ = io::stdout().flush();
        match self.lines.next()? {
            Ok(line) => Some(line),
            Err(e) => {
                log::warn!("stdin: {}", e);
                None
            }
        }
    }
}

/// Ask until the name is non-empty and colon-free. `None` if input ends first.
pub fn prompt_username() -> io::Result<Option<String>> {
    ask_username(io::stdin().lock(), io::stdout())
}

fn ask_username(input: impl BufRead, mut out: impl Write) -> io::Result<Option<String>> {
    let mut lines = input.lines();
    loop {
        write!(out, "Username: ")?;
        out.flush()?;
        let Some(line) = lines.next() else {
            return Ok(None);
        };
        let name = line?.trim().to_owned();
        if name.is_empty() {
            writeln!(out, "Username cannot be empty")?;
        } else if validate_sender(&name).is_err() {
            writeln!(out, "Username cannot contain ':'")?;
        } else {
            return Ok(Some(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn username_prompt_retries_until_valid() {
        let mut out = Vec::new();
        let name = ask_username(Cursor::new("\nal:ice\nalice\n"), &mut out).unwrap();
        assert_eq!(name.as_deref(), Some("alice"));
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("cannot be empty"));
        assert!(printed.contains("cannot contain ':'"));
    }

    #[test]
    fn username_prompt_ends_with_input() {
        let name = ask_username(Cursor::new("\n"), Vec::new()).unwrap();
        assert_eq!(name, None);
    }

    #[test]
    fn dialer_prompts_for_host_until_connected() {
        let dialer = Role::Dialer {
            username: "alice".into(),
        };
        assert_eq!(
            prompt(&dialer, ConnectionState::Disconnected),
            "Host to connect to (or exit to quit): "
        );
        assert_eq!(prompt(&dialer, ConnectionState::Connected), "> ");
        assert_eq!(prompt(&Role::Listener, ConnectionState::Disconnected), "> ");
    }
}
