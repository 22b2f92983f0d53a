//! Wire-level record types shared by the read and write sides of L2.

mod layer;

pub(crate) use layer::{OpenRecord, RecordLayer};

use core::fmt;
use std::cmp::Ordering;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};
use tinyvec::ArrayVec;

use crate::buffer::Buf;
use crate::util::be_u48;

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

/// Protocol version carried in record headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Dtls1_2,
    Tls1_2,
    Unknown(u16),
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ProtocolVersion {
    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolVersion::Dtls1_2 => 0xFEFD,
            ProtocolVersion::Tls1_2 => 0x0303,
            ProtocolVersion::Unknown(v) => *v,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            0xFEFD => ProtocolVersion::Dtls1_2,
            0x0303 => ProtocolVersion::Tls1_2,
            other => ProtocolVersion::Unknown(other),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, v) = be_u16(input)?;
        Ok((input, Self::from_u16(v)))
    }

    pub fn serialize(&self, out: &mut Buf) {
        out.extend_from_slice(&self.as_u16().to_be_bytes());
    }
}

/// Epoch plus 48-bit record sequence number.
///
/// The pair is the full wire identity of a datagram-mode record and the
/// value fed into nonce construction in both modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sequence {
    pub epoch: u16,
    pub number: u64,
}

impl Sequence {
    /// The 8-byte wire form: epoch followed by the 48-bit counter.
    pub fn to_wire(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..2].copy_from_slice(&self.epoch.to_be_bytes());
        out[2..].copy_from_slice(&self.number.to_be_bytes()[2..]);
        out
    }

    /// Inverse of [`Sequence::to_wire`].
    pub fn from_wire(wire: [u8; 8]) -> Self {
        let epoch = u16::from_be_bytes([wire[0], wire[1]]);
        let mut n = [0u8; 8];
        n[2..].copy_from_slice(&wire[2..]);
        Sequence {
            epoch,
            number: u64::from_be_bytes(n),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[epoch: {}, number: {}]", self.epoch, self.number)
    }
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.epoch, self.number).cmp(&(other.epoch, other.number))
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One record as parsed off the wire (datagram framing).
#[derive(Debug, PartialEq, Eq, Default)]
pub struct Record<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub payload: &'a [u8],
}

/// Upper bound on records packed into one datagram.
pub const MAX_RECORDS_PER_DATAGRAM: usize = 32;

impl<'a> Record<'a> {
    /// Datagram record header: type(1) version(2) epoch(2) seq(6) len(2).
    pub const DATAGRAM_HEADER_LEN: usize = 13;

    /// Stream record header: type(1) version(2) len(2).
    pub const STREAM_HEADER_LEN: usize = 5;

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Record<'a>> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, epoch) = be_u16(input)?;
        let (input, number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;
        let (rest, payload) = take(length as usize)(input)?;

        Ok((
            rest,
            Record {
                content_type,
                version,
                sequence: Sequence { epoch, number },
                payload,
            },
        ))
    }

    /// Parse every record out of one datagram. Trailing garbage or more
    /// than [`MAX_RECORDS_PER_DATAGRAM`] records fails the whole datagram.
    pub fn parse_all(
        input: &'a [u8],
    ) -> Result<ArrayVec<[Record<'a>; MAX_RECORDS_PER_DATAGRAM]>, ()> {
        let mut records = ArrayVec::default();
        let mut rest = input;

        while !rest.is_empty() {
            if records.len() == MAX_RECORDS_PER_DATAGRAM {
                return Err(());
            }
            match Record::parse(rest) {
                Ok((r, record)) => {
                    rest = r;
                    records.push(record);
                }
                Err(Err::Incomplete(_)) | Err(Err::Error(_)) | Err(Err::Failure(_)) => {
                    return Err(());
                }
            }
        }

        if records.is_empty() {
            return Err(());
        }

        Ok(records)
    }

    /// Serialize header and payload with datagram framing.
    pub fn serialize(&self, out: &mut Buf) {
        out.push(self.content_type.as_u8());
        self.version.serialize(out);
        out.extend_from_slice(&self.sequence.to_wire());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(self.payload);
    }
}

/// Build the additional authenticated data for a record.
///
/// The AAD is the record header with the *plaintext* length: in datagram
/// mode the full 13-byte header, in stream mode the 5-byte header prefixed
/// with the 8-byte implicit sequence.
pub(crate) fn record_aad(
    mode: crate::Mode,
    content_type: ContentType,
    version: ProtocolVersion,
    sequence: Sequence,
    plaintext_len: u16,
) -> ([u8; 13], usize) {
    let mut aad = [0u8; 13];
    match mode {
        crate::Mode::Datagram => {
            aad[0] = content_type.as_u8();
            aad[1..3].copy_from_slice(&version.as_u16().to_be_bytes());
            aad[3..11].copy_from_slice(&sequence.to_wire());
            aad[11..13].copy_from_slice(&plaintext_len.to_be_bytes());
            (aad, 13)
        }
        crate::Mode::Stream => {
            aad[..8].copy_from_slice(&sequence.number.to_be_bytes());
            aad[8] = content_type.as_u8();
            aad[9..11].copy_from_slice(&version.as_u16().to_be_bytes());
            aad[11..13].copy_from_slice(&plaintext_len.to_be_bytes());
            (aad, 13)
        }
    }
}
