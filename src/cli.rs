//! CLI utilities for the interactive client.
//!
//! Lines starting with `.` are client commands; anything else is sent to the server as a term.
use std::io::{self, BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("failed to read command: {0}")]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, also produced at end of input.
    Exit,
    /// `.use <db>`: change the default database.
    Use(String),
    /// Term text to run.
    Query(String),
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim() {
            ".exit" => Ok(Command::Exit),
            s if s == ".use" || s.starts_with(".use ") => {
                match s.split_whitespace().nth(1) {
                    Some(db) => Ok(Command::Use(db.to_string())),
                    None => Err(CommandError::InvalidCommandArguments {
                        command: ".use".to_string(),
                        reason: "requires a database name. Example: .use blog".to_string(),
                    }),
                }
            }
            s if s.starts_with('.') => Err(CommandError::UnrecognizedCommand(s.to_string())),
            s => Ok(Command::Query(s.to_string())),
        }
    }
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    s.as_str().try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_queries() {
        let input = b"[1, 2, 3]\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Query(String::from("[1, 2, 3]")), res);
    }

    #[test]
    fn prompt_end_of_input_exits() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b""[..], &mut output).unwrap(), Command::Exit);
    }

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            (".use blog", Command::Use(String::from("blog"))),
            ("  null  ", Command::Query(String::from("null"))),
        ];

        for (cmd, expected) in inputs {
            let command: Command = cmd.try_into().unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    #[should_panic(expected = "requires a database name")]
    fn use_without_database() {
        let _: Command = ".use".try_into().unwrap();
    }

    #[test]
    #[should_panic(expected = "UnrecognizedCommand")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }
}
