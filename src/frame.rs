//! Field framing shared by the config handshake and the telemetry broadcast.
//!
//! A frame is a 14 byte header followed by tagged fields. Every field starts
//! with its number and a type code; the type code decides the length:
//!
//! Type | Length        | Layout
//! 0x01 | 7             | nr, 0x01, a(2), b(2), 0xff
//! 0x03 | 12            | nr, 0x03, ?(4), 0xff, a(2), b(2), 0xff
//! 0x04 | 7 + text + 2  | nr, 0x04, ?(4), 0xff, text, 0x00, 0xff
//!
//! For type 0x03 the payload `7f ff ff ff` means the slot holds no value.
//! Decoding stops once fewer than 7 bytes remain, which skips the trailing
//! CRC.

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 14;

const MIN_FIELD_LEN: usize = 7;
const EXTENDED_FIELD_LEN: usize = 12;
const EMPTY_PAYLOAD: [u8; 4] = [0x7f, 0xff, 0xff, 0xff];
const TEXT_TERMINATOR: [u8; 2] = [0x00, 0xff];
const DELIMITER: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Compact = 0x01,
    Extended = 0x03,
    Text = 0x04,
}

impl TryFrom<u8> for FieldType {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        match code {
            0x01 => Ok(Self::Compact),
            0x03 => Ok(Self::Extended),
            0x04 => Ok(Self::Text),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Two big-endian 16 bit values
    Pair(u16, u16),
    Text(String),
    /// The device marked the slot as holding no value
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub number: u8,
    pub field_type: FieldType,
    pub value: FieldValue,
}

impl Field {
    pub fn compact(number: u8, a: u16, b: u16) -> Self {
        Self { number, field_type: FieldType::Compact, value: FieldValue::Pair(a, b) }
    }

    pub fn extended(number: u8, value: Option<(u16, u16)>) -> Self {
        let value = match value {
            Some((a, b)) => FieldValue::Pair(a, b),
            None => FieldValue::Empty,
        };
        Self { number, field_type: FieldType::Extended, value }
    }

    pub fn text(number: u8, text: impl Into<String>) -> Self {
        Self { number, field_type: FieldType::Text, value: FieldValue::Text(text.into()) }
    }

    /// Append the wire form of this field to `out`.
    ///
    /// The four bytes after the type code carry nothing we decode and are
    /// written as zero.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.number);
        out.push(self.field_type as u8);
        match (self.field_type, &self.value) {
            (FieldType::Compact, value) => {
                out.extend_from_slice(&payload(value));
                out.push(DELIMITER);
            }
            (FieldType::Extended, value) => {
                out.extend_from_slice(&[0, 0, 0, 0, DELIMITER]);
                out.extend_from_slice(&payload(value));
                out.push(DELIMITER);
            }
            (FieldType::Text, value) => {
                out.extend_from_slice(&[0, 0, 0, 0, DELIMITER]);
                if let FieldValue::Text(text) = value {
                    out.extend_from_slice(text.as_bytes());
                }
                out.extend_from_slice(&TEXT_TERMINATOR);
            }
        }
    }
}

fn payload(value: &FieldValue) -> [u8; 4] {
    match value {
        FieldValue::Pair(a, b) => {
            let [a0, a1] = a.to_be_bytes();
            let [b0, b1] = b.to_be_bytes();
            [a0, a1, b0, b1]
        }
        _ => EMPTY_PAYLOAD,
    }
}

/// Decoded fields of one frame, indexed by field number.
///
/// Field numbers are small and dense, so this is a plain vector of slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<Option<FieldValue>>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any earlier field with the same number.
    pub fn insert(&mut self, number: u8, value: FieldValue) {
        let index = usize::from(number);
        if self.0.len() <= index {
            self.0.resize(index + 1, None);
        }
        self.0[index] = Some(value);
    }

    pub fn get(&self, number: usize) -> Option<&FieldValue> {
        self.0.get(number).and_then(Option::as_ref)
    }

    pub fn pair(&self, number: usize) -> Option<(u16, u16)> {
        match self.get(number)? {
            FieldValue::Pair(a, b) => Some((*a, *b)),
            _ => None,
        }
    }

    pub fn text(&self, number: usize) -> Option<&str> {
        match self.get(number)? {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Number of populated fields
    pub fn len(&self) -> usize {
        self.0.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field numbers whose value differs between `self` and `other`,
    /// including fields present in only one of them.
    pub fn changed_since<'a>(&'a self, other: &'a Fields) -> impl Iterator<Item = usize> + 'a {
        let len = self.0.len().max(other.0.len());
        (0..len).filter(move |&number| self.get(number) != other.get(number))
    }
}

impl FromIterator<Field> for Fields {
    fn from_iter<T: IntoIterator<Item = Field>>(iter: T) -> Self {
        let mut fields = Fields::new();
        for field in iter {
            fields.insert(field.number, field.value);
        }
        fields
    }
}

/// Decode a frame into its field table.
pub fn parse(frame: &[u8]) -> Result<Fields> {
    Ok(decode_fields(frame)?.into_iter().collect())
}

/// Decode a frame into its fields, in wire order.
pub fn decode_fields(frame: &[u8]) -> Result<Vec<Field>> {
    let mut rest = frame.get(HEADER_LEN..).ok_or_else(|| {
        Error::MalformedFrame(format!(
            "{} bytes is shorter than the {HEADER_LEN} byte header",
            frame.len()
        ))
    })?;

    let mut fields = Vec::new();
    while rest.len() >= MIN_FIELD_LEN {
        let (field, len) = decode_field(rest)?;
        fields.push(field);
        rest = &rest[len..];
    }
    Ok(fields)
}

/// Decode the field at the start of `bytes`, returning it with the number of
/// bytes it occupies. `bytes` holds at least `MIN_FIELD_LEN` bytes.
fn decode_field(bytes: &[u8]) -> Result<(Field, usize)> {
    let number = bytes[0];
    let field_type = FieldType::try_from(bytes[1])
        .map_err(|field_type| Error::UnknownFieldType { field: number, field_type })?;

    match field_type {
        FieldType::Compact => {
            let (a, b) = read_pair(&bytes[2..6]);
            Ok((Field::compact(number, a, b), MIN_FIELD_LEN))
        }
        FieldType::Extended => {
            let data = bytes.get(7..11).filter(|_| bytes.len() >= EXTENDED_FIELD_LEN).ok_or_else(|| {
                Error::MalformedFrame(format!(
                    "field {number} needs {EXTENDED_FIELD_LEN} bytes, {} left",
                    bytes.len()
                ))
            })?;
            let value = if data == EMPTY_PAYLOAD { None } else { Some(read_pair(data)) };
            Ok((Field::extended(number, value), EXTENDED_FIELD_LEN))
        }
        FieldType::Text => {
            let body = &bytes[MIN_FIELD_LEN..];
            let end = body
                .windows(TEXT_TERMINATOR.len())
                .position(|window| window == TEXT_TERMINATOR)
                .ok_or_else(|| {
                    Error::MalformedFrame(format!("text field {number} is not terminated"))
                })?;
            let text = String::from_utf8_lossy(&body[..end]).into_owned();
            Ok((Field::text(number, text), MIN_FIELD_LEN + end + TEXT_TERMINATOR.len()))
        }
    }
}

fn read_pair(bytes: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    )
}

/// Build a frame from a header and fields. The CRC is not included.
pub fn encode(header: &[u8; HEADER_LEN], fields: &[Field]) -> Vec<u8> {
    let mut frame = header.to_vec();
    for field in fields {
        field.encode(&mut frame);
    }
    frame
}

/// Bytes 7..11 of every header seen so far
const HEADER_MAGIC: [u8; 4] = [0x04, 0x8c, 0x55, 0x4b];
/// Bytes 11..13 of the header count the bytes after byte 12, CRC included
pub(crate) const LENGTH_END: usize = 13;

/// Build a complete message as the config service exchanges them: header
/// with command and length, the fields, and the CRC.
pub fn message(command: u8, fields: &[Field]) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    header[5] = DELIMITER;
    header[6] = command;
    header[7..11].copy_from_slice(&HEADER_MAGIC);
    header[HEADER_LEN - 1] = DELIMITER;

    let mut frame = encode(&header, fields);
    let len = u16::try_from(frame.len() + 2 - LENGTH_END).unwrap_or(u16::MAX);
    frame[11..LENGTH_END].copy_from_slice(&len.to_be_bytes());
    crate::crc::append(&mut frame);
    frame
}

#[cfg(test)]
const TEST_HEADER: [u8; HEADER_LEN] =
    [0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x41, 0x04, 0x8c, 0x55, 0x4b, 0x00, 0x00, 0xff];

#[test]
fn test_parse_count_response() {
    let response =
        hex::decode("0000000000ff02048c554b0011ff01010000001eff020100000030ff32cf").unwrap();
    let fields = parse(&response).unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields.pair(1), Some((0, 30)));
    assert_eq!(fields.pair(2), Some((0, 48)));
    assert_eq!(fields.get(0), None);
}

#[test]
fn test_round_trip_all_field_types() {
    let fields = vec![
        Field::compact(0, 0, 5),
        Field::extended(1, Some((0, 3))),
        Field::extended(2, None),
        Field::text(3, "Engine Room"),
        Field::text(4, ""),
        Field::compact(5, 65535, 1),
    ];
    let mut frame = encode(&TEST_HEADER, &fields);
    crate::crc::append(&mut frame);

    assert_eq!(decode_fields(&frame).unwrap(), fields);
    let table = parse(&frame).unwrap();
    assert_eq!(table.get(2), Some(&FieldValue::Empty));
    assert_eq!(table.pair(2), None);
    assert_eq!(table.text(3), Some("Engine Room"));
}

#[test]
fn test_parse_is_repeatable() {
    let frame = encode(&TEST_HEADER, &[Field::compact(0, 1, 2), Field::text(1, "x")]);
    assert_eq!(parse(&frame).unwrap(), parse(&frame).unwrap());
}

#[test]
fn test_duplicate_field_last_wins() {
    let frame = encode(&TEST_HEADER, &[Field::compact(3, 1, 1), Field::compact(3, 2, 2)]);
    let fields = parse(&frame).unwrap();
    assert_eq!(fields.pair(3), Some((2, 2)));
    assert_eq!(fields.len(), 1);
}

#[test]
fn test_unknown_field_type() {
    let mut frame = TEST_HEADER.to_vec();
    frame.extend_from_slice(&[0x07, 0x09, 0x00, 0x00, 0x00, 0x00, 0xff]);
    match parse(&frame) {
        Err(Error::UnknownFieldType { field: 7, field_type: 0x09 }) => {}
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_truncated_frames() {
    assert!(matches!(parse(&TEST_HEADER[..10]), Err(Error::MalformedFrame(_))));

    let mut extended = TEST_HEADER.to_vec();
    extended.extend_from_slice(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0xff, 0x00, 0x01]);
    assert!(matches!(parse(&extended), Err(Error::MalformedFrame(_))));

    let mut text = TEST_HEADER.to_vec();
    text.extend_from_slice(&[0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0xff, b'a', b'b', b'c']);
    assert!(matches!(parse(&text), Err(Error::MalformedFrame(_))));
}

#[test]
fn test_short_tail_is_ignored() {
    let mut frame = encode(&TEST_HEADER, &[Field::compact(0, 1, 2)]);
    frame.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(parse(&frame).unwrap().len(), 1);
}

#[test]
fn test_changed_since() {
    let old: Fields = [Field::compact(0, 1, 2), Field::compact(1, 3, 4)].into_iter().collect();
    let new: Fields = [Field::compact(0, 1, 2), Field::compact(1, 3, 5), Field::compact(4, 0, 0)]
        .into_iter()
        .collect();
    assert_eq!(new.changed_since(&old).collect::<Vec<_>>(), vec![1, 4]);
}

#[test]
fn test_message_matches_request_templates() {
    assert_eq!(hex::encode(message(0x02, &[])), "0000000000ff02048c554b0003ffa8c0");
    assert_eq!(
        hex::encode(message(0x41, &[Field::compact(0, 0, 3), Field::extended(1, Some((0, 0)))])),
        "0000000000ff41048c554b0016ff000100000003ff010300000000ff00000000ff85ee"
    );
}
