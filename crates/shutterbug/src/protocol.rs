//! Control protocol - message grammar
//!
//! Messages are comma separated, tag first:
//!
//! ```text
//! ack                         → reply with identity
//! exec,stdby                  → standby, timestamp
//! exec,start <align> <folder> → start a session in <folder>
//! exec,stop                   → stop the session, timestamp
//! exec,beep <n>               → audible signal, n pulses
//! set,<role>                  → relabel the node
//! ```
//!
//! Tags are matched before anything else, so an `exec` whose folder happens
//! to contain "ack" is still an `exec`. Untagged text containing "ack" is an
//! ack only when lenient matching is on (the deployed coordinator relies on it).

use chrono::NaiveDateTime;

use crate::frame::AlignMode;

/// `strftime` pattern of the timestamps returned by `stdby` and `stop`.
pub const TIMESTAMP_FORMAT: &str = "%y%m%d_%H%M%S";

/// Highest accepted `beep` pulse count.
pub const MAX_PULSES: u8 = 9;

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub lenient_ack: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { lenient_ack: true }
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ack,
    Exec(Command),
    SetRole(String),
    /// Recognised tag, unusable body.
    Invalid(ProtocolError),
    Unknown,
}

/// A parsed `exec` instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Standby,
    Start(StartArgs),
    Stop,
    Signal { pulses: u8 },
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartArgs {
    pub align_mode: AlignMode,
    /// Folder token as sent, placeholder not yet substituted.
    pub folder: String,
}

impl StartArgs {
    /// Folder with every `placeholder` replaced by `role`.
    pub fn folder_for(&self, role: &str, placeholder: &str) -> String {
        self.folder.replace(placeholder, role)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("'{tag}' message has no body")]
    MissingBody { tag: &'static str },

    #[error("empty exec command")]
    EmptyCommand,

    #[error("start needs <align-mode> <folder>, got '{0}'")]
    StartArgs(String),

    #[error("unknown align mode '{0}'")]
    AlignMode(String),

    #[error("beep needs a pulse count 1..=9, got '{0}'")]
    Pulses(String),

    #[error("role must not be empty")]
    EmptyRole,
}

/// Classify one inbound message.
pub fn parse_message(text: &str, options: ParseOptions) -> Message {
    let text = text.trim();
    let (tag, body) = match text.split_once(',') {
        Some((tag, body)) => (tag.trim(), Some(body)),
        None => (text, None),
    };

    match tag {
        "exec" => {
            return match body {
                Some(body) => match parse_command(body) {
                    Ok(cmd) => Message::Exec(cmd),
                    Err(e) => Message::Invalid(e),
                },
                None => Message::Invalid(ProtocolError::MissingBody { tag: "exec" }),
            };
        }
        "set" => {
            return match body {
                Some(body) => parse_role(body),
                None => Message::Invalid(ProtocolError::MissingBody { tag: "set" }),
            };
        }
        "ack" => return Message::Ack,
        _ => {}
    }

    if options.lenient_ack && text.contains("ack") {
        Message::Ack
    } else {
        Message::Unknown
    }
}

fn parse_role(body: &str) -> Message {
    // Only the first field names the role; anything after another comma is ignored
    let role = body.split(',').next().unwrap_or_default().trim();
    if role.is_empty() {
        Message::Invalid(ProtocolError::EmptyRole)
    } else {
        Message::SetRole(role.to_string())
    }
}

/// Parse the body of an `exec` message: a verb, a space, the remainder.
pub fn parse_command(body: &str) -> Result<Command, ProtocolError> {
    let body = body.trim();
    let (verb, rest) = body.split_once(' ').unwrap_or((body, ""));

    match verb {
        "" => Err(ProtocolError::EmptyCommand),
        "stdby" => Ok(Command::Standby),
        "stop" => Ok(Command::Stop),
        "start" => {
            let mut args = rest.split_whitespace();
            let (Some(align), Some(folder)) = (args.next(), args.next()) else {
                return Err(ProtocolError::StartArgs(rest.trim().to_string()));
            };
            let align_mode =
                AlignMode::parse(align).ok_or_else(|| ProtocolError::AlignMode(align.to_string()))?;
            Ok(Command::Start(StartArgs {
                align_mode,
                folder: folder.to_string(),
            }))
        }
        "beep" => {
            let arg = rest.split_whitespace().next().unwrap_or_default();
            match arg.parse::<u8>() {
                Ok(pulses) if (1..=MAX_PULSES).contains(&pulses) => Ok(Command::Signal { pulses }),
                _ => Err(ProtocolError::Pulses(arg.to_string())),
            }
        }
        other => Ok(Command::Unrecognized(other.to_string())),
    }
}

/// Local wall-clock time as `YYMMDD_HHMMSS`.
pub fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Inverse of [`timestamp`].
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Message {
        parse_message(text, ParseOptions::default())
    }

    #[test]
    fn test_ack_substring_is_lenient() {
        assert_eq!(parse("ack"), Message::Ack);
        assert_eq!(parse("please ack now"), Message::Ack);
        let strict = ParseOptions { lenient_ack: false };
        assert_eq!(parse_message("please ack now", strict), Message::Unknown);
        assert_eq!(parse_message("ack", strict), Message::Ack);
    }

    #[test]
    fn test_exec_tag_wins_over_ack_substring() {
        match parse("exec,start HW backyard_--") {
            Message::Exec(Command::Start(args)) => {
                assert_eq!(args.align_mode, AlignMode::Hardware);
                assert_eq!(args.folder, "backyard_--");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_start_folder_substitution() {
        let args = StartArgs {
            align_mode: AlignMode::Hardware,
            folder: "--_folder".to_string(),
        };
        assert_eq!(args.folder_for("TX", "--"), "TX_folder");

        let args = StartArgs {
            align_mode: AlignMode::Software,
            folder: "--/run--".to_string(),
        };
        assert_eq!(args.folder_for("RX", "--"), "RX/runRX");
    }

    #[test]
    fn test_simple_verbs() {
        assert_eq!(parse("exec,stdby"), Message::Exec(Command::Standby));
        assert_eq!(parse("exec,stop"), Message::Exec(Command::Stop));
        assert_eq!(parse(" exec,stop \n"), Message::Exec(Command::Stop));
        assert_eq!(parse("exec,beep 2"), Message::Exec(Command::Signal { pulses: 2 }));
        assert_eq!(
            parse("exec,reboot now"),
            Message::Exec(Command::Unrecognized("reboot".to_string()))
        );
    }

    #[test]
    fn test_malformed_messages() {
        assert_eq!(
            parse("exec"),
            Message::Invalid(ProtocolError::MissingBody { tag: "exec" })
        );
        assert_eq!(parse("exec,"), Message::Invalid(ProtocolError::EmptyCommand));
        assert!(matches!(
            parse("exec,start HW"),
            Message::Invalid(ProtocolError::StartArgs(_))
        ));
        assert!(matches!(
            parse("exec,start FAST folder"),
            Message::Invalid(ProtocolError::AlignMode(_))
        ));
        assert!(matches!(
            parse("exec,beep 0"),
            Message::Invalid(ProtocolError::Pulses(_))
        ));
        assert!(matches!(
            parse("exec,beep"),
            Message::Invalid(ProtocolError::Pulses(_))
        ));
        assert_eq!(parse("set,"), Message::Invalid(ProtocolError::EmptyRole));
        assert_eq!(parse("set"), Message::Invalid(ProtocolError::MissingBody { tag: "set" }));
    }

    #[test]
    fn test_set_role_takes_first_field() {
        assert_eq!(parse("set,RX"), Message::SetRole("RX".to_string()));
        assert_eq!(parse("set, RX ,junk"), Message::SetRole("RX".to_string()));
    }

    #[test]
    fn test_unknown_shapes() {
        assert_eq!(parse("hello"), Message::Unknown);
        assert_eq!(parse("get,role"), Message::Unknown);
        assert_eq!(parse(""), Message::Unknown);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = timestamp();
        assert_eq!(ts.len(), 13);
        assert_eq!(ts.as_bytes()[6], b'_');
        assert!(ts
            .chars()
            .enumerate()
            .all(|(i, c)| if i == 6 { c == '_' } else { c.is_ascii_digit() }));

        let parsed = parse_timestamp(&ts).expect("timestamp parses back");
        let now = chrono::Local::now().naive_local();
        assert!((now - parsed).num_seconds().abs() < 5);
    }
}
