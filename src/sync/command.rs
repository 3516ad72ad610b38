//! Command envelope codec
//!
//! A command travels as a plain UTF-8 payload:
//!
//! ```text
//! </>command;;</>jump;</>up
//! └── marker ───┘└cmd┘    └param
//! ```
//!
//! Decoding splits the whole payload on `;</>` and drops empty pieces. The marker
//! residue is field 0, the command name field 1 and the parameter field 2. Anything
//! after that is kept verbatim in [`Command::extra`].

use super::error::SyncError;

pub const COMMAND_MARKER: &str = "</>command;;</>";
pub const FIELD_DELIMITER: &str = ";</>";

/// Result of classifying an inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Command(&'a str),
    Data(&'a str),
}

impl<'a> Payload<'a> {
    pub fn classify(text: &'a str) -> Self {
        if is_command(text) {
            Payload::Command(text)
        } else {
            Payload::Data(text)
        }
    }
}

/// Decoded remote command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub parameter: String,
    /// Trailing fields past the parameter, in wire order
    pub extra: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameter: parameter.into(),
            extra: Vec::new(),
        }
    }

    pub fn decode(payload: &str) -> Result<Self, SyncError> {
        let fields: Vec<&str> = payload
            .split(FIELD_DELIMITER)
            .filter(|field| !field.is_empty())
            .collect();

        if fields.len() < 3 {
            return Err(SyncError::MalformedCommand {
                fields: fields.len(),
            });
        }

        Ok(Self {
            name: fields[1].to_string(),
            parameter: fields[2].to_string(),
            extra: fields[3..].iter().map(|f| f.to_string()).collect(),
        })
    }

    /// Produces the wire form; fails for inputs that would not decode back unchanged
    pub fn encode(&self) -> Result<String, SyncError> {
        if !is_valid_command_name(&self.name) {
            return Err(SyncError::InvalidCommand(format!(
                "command name '{}' must match [a-zA-Z0-9]+",
                self.name
            )));
        }
        if self.parameter.is_empty() {
            return Err(SyncError::InvalidCommand(
                "parameter must not be empty".to_string(),
            ));
        }
        for field in std::iter::once(&self.parameter).chain(self.extra.iter()) {
            if field.contains(FIELD_DELIMITER) {
                return Err(SyncError::InvalidCommand(format!(
                    "field must not contain '{}'",
                    FIELD_DELIMITER
                )));
            }
        }

        let mut wire = format!(
            "{}{}{}{}",
            COMMAND_MARKER, self.name, FIELD_DELIMITER, self.parameter
        );
        for field in self.extra.iter().filter(|f| !f.is_empty()) {
            wire.push_str(FIELD_DELIMITER);
            wire.push_str(field);
        }
        Ok(wire)
    }
}

pub fn is_command(payload: &str) -> bool {
    payload.starts_with(COMMAND_MARKER)
}

pub fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}
