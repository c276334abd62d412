//! Input loop: feeds user commands to the session until exit or end of input.

use crate::session::{Flow, Role, Session, SessionError};

/// Source of successive user commands. `None` means input ended.
pub trait UserInput {
    fn next_command(&mut self) -> Option<String>;
}

/// Run one peer: the listener starts waiting for a peer right away, then every
/// command goes to the session. End of input shuts the session down like `exit`.
pub fn run(session: &Session, input: &mut dyn UserInput) -> Result<(), SessionError> {
    if *session.role() == Role::Listener {
        session.begin_listening()?;
    }
    while let Some(line) = input.next_command() {
        if session.handle_input(&line) == Flow::Exit || session.is_terminated() {
            return Ok(());
        }
    }
    session.shutdown();
    Ok(())
}
