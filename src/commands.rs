//! Разбор строк, введённых пользователем в CLI.

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Позвонить участнику комнаты
    Call,
    Mute,
    Hold,
    End,
    State,
    Help,
    Quit,
    Chat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command /{0}, try /help")]
    Unknown(String),
    #[error("nothing to send")]
    Empty,
}

pub const HELP: &str = "\
/call   call the other participant
/mute   toggle microphone
/hold   toggle camera
/end    end the current call
/state  print call state
/quit   leave the room and exit
anything else is sent as a chat message";

impl FromStr for UserCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(UserCommand::Chat(line.to_string()));
        };
        // "//текст" отправляет текст, начинающийся с "/"
        if command.starts_with('/') {
            return Ok(UserCommand::Chat(command.to_string()));
        }
        match command.to_ascii_lowercase().as_str() {
            "call" => Ok(UserCommand::Call),
            "mute" => Ok(UserCommand::Mute),
            "hold" => Ok(UserCommand::Hold),
            "end" | "hangup" => Ok(UserCommand::End),
            "state" => Ok(UserCommand::State),
            "help" | "?" => Ok(UserCommand::Help),
            "quit" | "exit" => Ok(UserCommand::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}
