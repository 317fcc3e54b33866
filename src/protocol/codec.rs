use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use super::command::Command;
use super::report::{PushUpdate, Report};
use crate::core::{Error, Result};

/// A classified inbound datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Numbered report
    Report(Report),
    /// `TCH-OK :done`
    Ack,
    /// `TCH-ERR`, with the full reply text
    Nak(String),
    /// Reply to `i`, with the firmware text
    Identity(String),
    /// Our own `i` broadcast looping back
    Echo,
    /// Report fields pushed without an `ID`
    Push(PushUpdate),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Report(_) => "report",
            Payload::Ack => "ack",
            Payload::Nak(_) => "nak",
            Payload::Identity(_) => "identity",
            Payload::Echo => "echo",
            Payload::Push(_) => "push",
        }
    }
}

/// Datagram codec for the KeContact protocol
///
/// One datagram carries exactly one command or reply, so the decoder
/// consumes the whole buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StationCodec;

impl StationCodec {
    /// Creates a new station codec
    pub fn new() -> Self {
        StationCodec
    }

    /// Validates the command and renders its wire string
    pub fn encode_command(&self, command: &Command) -> Result<Bytes> {
        command.validate()?;
        Ok(Bytes::from(command.to_string()))
    }

    /// Classifies an inbound datagram
    pub fn decode_payload(&self, datagram: &[u8]) -> Result<Payload> {
        let text = String::from_utf8_lossy(datagram);
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        if text.is_empty() {
            return Err(Error::parse(text, "empty payload"));
        }
        if text == "i" {
            return Ok(Payload::Echo);
        }
        if text.contains("TCH-ERR") {
            return Ok(Payload::Nak(text.to_string()));
        }
        if text.contains("TCH-OK") {
            return Ok(Payload::Ack);
        }
        if let Some(rest) = text.strip_prefix("\"Firmware\"") {
            let firmware = rest
                .trim_start()
                .strip_prefix(':')
                .map(|value| value.trim().trim_matches('"').to_string())
                .ok_or_else(|| Error::parse(text, "malformed identity reply"))?;
            return Ok(Payload::Identity(firmware));
        }
        if text.starts_with('{') {
            let value: Value =
                serde_json::from_str(text).map_err(|e| Error::parse(text, e.to_string()))?;
            if !value.is_object() {
                return Err(Error::parse(text, "JSON payload is not an object"));
            }
            if value.get("ID").is_some() {
                return Report::from_value(value)
                    .map(Payload::Report)
                    .map_err(|e| match e {
                        Error::Parse { reason, .. } => Error::parse(text, reason),
                        other => other,
                    });
            }
            return serde_json::from_value(value)
                .map(Payload::Push)
                .map_err(|e| Error::parse(text, e.to_string()));
        }

        Err(Error::parse(text, "unrecognised payload"))
    }
}

impl Encoder<Command> for StationCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let bytes = self.encode_command(&item)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

impl Decoder for StationCodec {
    type Item = Payload;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        self.decode_payload(&datagram).map(Some)
    }
}
