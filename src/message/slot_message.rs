use crate::crc;
use crate::error::Result;
use crate::frame::{self, Fields};

/// Asks the device for the descriptor of one sensor slot
const REQUEST_TEMPLATE: [u8; 33] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x41, 0x04, 0x8c, 0x55, 0x4b, 0x00, 0x16, 0xff, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x00, 0xff, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00,
    0xff,
];

/// Where the requested slot index goes in the template
const SLOT_INDEX: usize = 19;

pub(crate) fn request(pos: u8) -> Vec<u8> {
    let mut request = REQUEST_TEMPLATE.to_vec();
    request[SLOT_INDEX] = pos;
    crc::append(&mut request);
    request
}

/// The descriptor of one slot, as decoded fields.
pub(crate) struct SlotMessage(Fields);

impl SlotMessage {
    pub fn new(data: &[u8]) -> Result<Self> {
        Ok(Self(frame::parse(data)?))
    }

    pub fn into_fields(self) -> Fields {
        self.0
    }
}

#[test]
fn test_request_bytes() {
    assert_eq!(
        hex::encode(request(0)),
        "0000000000ff41048c554b0016ff000100000000ff010300000000ff00000000ffe819"
    );
    assert_eq!(
        hex::encode(request(3)),
        "0000000000ff41048c554b0016ff000100000003ff010300000000ff00000000ff85ee"
    );
}

#[test]
fn test_request_embeds_slot_as_field_zero() {
    let fields = frame::parse(&request(7)).unwrap();
    assert_eq!(fields.pair(0), Some((0, 7)));
    assert_eq!(fields.pair(1), Some((0, 0)));
}
