//! Message Bus Envelope
//!
//! Bus payloads are single text lines of the form `source>destination TYPE body`.

use super::router::MessageKind;
use crate::error::MechError;
use std::fmt;
use std::str::FromStr;

/// Envelope type field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    Req,
    Exec,
    Done,
    Error,
    Warning,
    Fatal,
    Status,
}

impl EnvelopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::Req => "REQ",
            EnvelopeType::Exec => "EXEC",
            EnvelopeType::Done => "DONE",
            EnvelopeType::Error => "ERROR",
            EnvelopeType::Warning => "WARNING",
            EnvelopeType::Fatal => "FATAL",
            EnvelopeType::Status => "STATUS",
        }
    }
}

impl FromStr for EnvelopeType {
    type Err = MechError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REQ" => Ok(EnvelopeType::Req),
            "EXEC" => Ok(EnvelopeType::Exec),
            "DONE" => Ok(EnvelopeType::Done),
            "ERROR" => Ok(EnvelopeType::Error),
            "WARNING" => Ok(EnvelopeType::Warning),
            "FATAL" => Ok(EnvelopeType::Fatal),
            "STATUS" => Ok(EnvelopeType::Status),
            other => Err(MechError::ParseError(format!("envelope type '{}'", other))),
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: String,
    pub destination: String,
    pub kind: EnvelopeType,
    pub body: String,
}

impl Envelope {
    /// Router privilege for dispatchable envelopes, `None` for everything else
    pub fn message_kind(&self) -> Option<MessageKind> {
        match self.kind {
            EnvelopeType::Req => Some(MessageKind::Request),
            EnvelopeType::Exec => Some(MessageKind::Exec),
            _ => None,
        }
    }

    /// Build the reply to this envelope from a router reply line
    ///
    /// # Arguments
    /// * `me` - Name of this server on the bus
    /// * `reply` - A `DONE:`/`ERROR:`/`WARNING:`/`FATAL:` line
    pub fn reply_to(&self, me: &str, reply: &str) -> Envelope {
        let (kind, body) = match reply.split_once(':') {
            Some((tag, body)) => match tag.parse::<EnvelopeType>() {
                Ok(kind) => (kind, body.trim()),
                Err(_) => (EnvelopeType::Status, reply.trim()),
            },
            None => (EnvelopeType::Status, reply.trim()),
        };
        Envelope {
            source: me.to_string(),
            destination: self.source.clone(),
            kind,
            body: body.to_string(),
        }
    }
}

impl FromStr for Envelope {
    type Err = MechError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (route, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| MechError::ParseError(format!("envelope '{}'", s)))?;
        let (source, destination) = route
            .split_once('>')
            .ok_or_else(|| MechError::ParseError(format!("envelope route '{}'", route)))?;
        if source.is_empty() || destination.is_empty() {
            return Err(MechError::ParseError(format!("envelope route '{}'", route)));
        }

        let rest = rest.trim_start();
        let (kind, body) = match rest.split_once(char::is_whitespace) {
            Some((kind, body)) => (kind, body.trim()),
            None => (rest, ""),
        };

        Ok(Envelope {
            source: source.to_string(),
            destination: destination.to_string(),
            kind: kind.parse()?,
            body: body.to_string(),
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{} {}", self.source, self.destination, self.kind)?;
        if !self.body.is_empty() {
            write!(f, " {}", self.body)?;
        }
        Ok(())
    }
}
