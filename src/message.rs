//! L3: typed message demultiplexing.
//!
//! The message layer labels decrypted record payloads by content type,
//! splits handshake records into handshake fragments (header plus body) and
//! enforces the minimal per-type payload invariants. It never reassembles:
//! fragments are presented one at a time to the layer above.

use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::buffer::Buf;
use crate::error::{Error, Layer};
use crate::util::{be_u24, put_u24};
use crate::Mode;

/// The message types delivered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// A handshake message (or, internally, a fragment of one).
    Handshake,
    /// Application data.
    ApplicationData,
    /// A non-fatal alert.
    Alert,
    /// A ChangeCipherSpec marker.
    ChangeCipherSpec,
}

/// Alert severity on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
        }
    }
}

/// Alert descriptions. Only the values this stack itself emits or
/// special-cases are named; everything else passes through as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify,
    UnexpectedMessage,
    BadRecordMac,
    RecordOverflow,
    HandshakeFailure,
    IllegalParameter,
    DecodeError,
    DecryptError,
    ProtocolVersion,
    InternalError,
    Unknown(u8),
}

impl AlertDescription {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => AlertDescription::CloseNotify,
            10 => AlertDescription::UnexpectedMessage,
            20 => AlertDescription::BadRecordMac,
            22 => AlertDescription::RecordOverflow,
            40 => AlertDescription::HandshakeFailure,
            47 => AlertDescription::IllegalParameter,
            50 => AlertDescription::DecodeError,
            51 => AlertDescription::DecryptError,
            70 => AlertDescription::ProtocolVersion,
            80 => AlertDescription::InternalError,
            other => AlertDescription::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            AlertDescription::CloseNotify => 0,
            AlertDescription::UnexpectedMessage => 10,
            AlertDescription::BadRecordMac => 20,
            AlertDescription::RecordOverflow => 22,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::IllegalParameter => 47,
            AlertDescription::DecodeError => 50,
            AlertDescription::DecryptError => 51,
            AlertDescription::ProtocolVersion => 70,
            AlertDescription::InternalError => 80,
            AlertDescription::Unknown(v) => *v,
        }
    }
}

/// A parsed alert body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    /// Alert bodies are exactly two bytes with a known level.
    pub fn parse(payload: &[u8]) -> Result<Alert, Error> {
        if payload.len() != 2 {
            return Err(Error::InvalidRecord(Layer::Message));
        }
        let level = match payload[0] {
            1 => AlertLevel::Warning,
            2 => AlertLevel::Fatal,
            _ => return Err(Error::InvalidRecord(Layer::Message)),
        };
        Ok(Alert {
            level,
            description: AlertDescription::from_u8(payload[1]),
        })
    }

    pub fn serialize(&self, out: &mut Buf) {
        out.push(self.level.as_u8());
        out.push(self.description.as_u8());
    }
}

/// A ChangeCipherSpec body is exactly one byte of value 1.
pub fn check_ccs(payload: &[u8]) -> Result<(), Error> {
    if payload != [1] {
        return Err(Error::InvalidRecord(Layer::Message));
    }
    Ok(())
}

/// Handshake message header.
///
/// Datagram form carries the message sequence number and fragment window;
/// stream form is just type and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeHeader {
    /// Handshake message type, opaque to this stack.
    pub msg_type: u8,
    /// Total length of the handshake message body.
    pub length: usize,
    /// Handshake sequence number (datagram mode; 0 in stream mode).
    pub message_seq: u16,
    /// Offset of this fragment into the message body.
    pub fragment_offset: usize,
    /// Length of this fragment.
    pub fragment_length: usize,
}

impl HandshakeHeader {
    /// type(1) len(3) seq(2) frag_off(3) frag_len(3)
    pub const DATAGRAM_LEN: usize = 12;
    /// type(1) len(3)
    pub const STREAM_LEN: usize = 4;

    pub fn parse_datagram(input: &[u8]) -> IResult<&[u8], HandshakeHeader> {
        let (input, msg_type) = be_u8(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;
        Ok((
            input,
            HandshakeHeader {
                msg_type,
                length: length as usize,
                message_seq,
                fragment_offset: fragment_offset as usize,
                fragment_length: fragment_length as usize,
            },
        ))
    }

    pub fn parse_stream(input: &[u8]) -> IResult<&[u8], HandshakeHeader> {
        let (input, msg_type) = be_u8(input)?;
        let (input, length) = be_u24(input)?;
        Ok((
            input,
            HandshakeHeader {
                msg_type,
                length: length as usize,
                message_seq: 0,
                fragment_offset: 0,
                fragment_length: length as usize,
            },
        ))
    }

    pub fn serialize_datagram(&self, out: &mut Buf) {
        out.push(self.msg_type);
        put_u24(out, self.length as u32);
        out.extend_from_slice(&self.message_seq.to_be_bytes());
        put_u24(out, self.fragment_offset as u32);
        put_u24(out, self.fragment_length as u32);
    }

    pub fn serialize_stream(&self, out: &mut Buf) {
        out.push(self.msg_type);
        put_u24(out, self.length as u32);
    }
}

/// One handshake fragment as cut out of a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub header: HandshakeHeader,
    pub body: &'a [u8],
}

/// Split a datagram-mode handshake record payload into its fragments.
///
/// A record may carry several back-to-back handshake fragments. Each must
/// have a complete header, a body of exactly `fragment_length` bytes, and a
/// fragment window inside the declared total length; anything else fails
/// the whole record.
pub fn split_fragments(payload: &[u8], mode: Mode) -> Result<Vec<Fragment<'_>>, Error> {
    let mut out = Vec::new();
    let mut rest = payload;

    if rest.is_empty() {
        return Err(Error::InvalidRecord(Layer::Message));
    }

    while !rest.is_empty() {
        let (after, header) = match mode {
            Mode::Datagram => HandshakeHeader::parse_datagram(rest),
            Mode::Stream => HandshakeHeader::parse_stream(rest),
        }
        .map_err(|_| Error::InvalidRecord(Layer::Message))?;

        if header.fragment_length > after.len() {
            return Err(Error::InvalidRecord(Layer::Message));
        }
        if header
            .fragment_offset
            .checked_add(header.fragment_length)
            .map(|end| end > header.length)
            .unwrap_or(true)
        {
            return Err(Error::InvalidRecord(Layer::Message));
        }

        let (body, after) = after.split_at(header.fragment_length);
        out.push(Fragment { header, body });
        rest = after;
    }

    Ok(out)
}
