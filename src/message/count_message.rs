use crate::crc;
use crate::error::{Error, Result};

/// Asks the device how many sensor slots it has configured
const REQUEST_TEMPLATE: [u8; 14] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x02, 0x04, 0x8c, 0x55, 0x4b, 0x00, 0x03, 0xff,
];

/// Byte holding the index of the last configured slot
const LAST_SLOT_INDEX: usize = 19;

pub(crate) fn request() -> Vec<u8> {
    let mut request = REQUEST_TEMPLATE.to_vec();
    crc::append(&mut request);
    request
}

/// The device's answer to the count request.
pub(crate) struct CountMessage(Vec<u8>);

impl CountMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn slot_count(&self) -> Result<usize> {
        self.0
            .get(LAST_SLOT_INDEX)
            .map(|&last| usize::from(last) + 1)
            .ok_or_else(|| {
                Error::MalformedFrame(format!(
                    "count response has {} bytes, expected at least {}",
                    self.0.len(),
                    LAST_SLOT_INDEX + 1
                ))
            })
    }
}

#[test]
fn test_request_bytes() {
    assert_eq!(hex::encode(request()), "0000000000ff02048c554b0003ffa8c0");
}

#[test]
fn test_slot_count() {
    let response =
        hex::decode("0000000000ff02048c554b0011ff01010000001eff020100000030ff32cf").unwrap();
    assert_eq!(CountMessage::new(response).slot_count().unwrap(), 31);
}

#[test]
fn test_slot_count_short_response() {
    let response = hex::decode("0000000000ff02048c554b0011ff0101").unwrap();
    assert!(matches!(CountMessage::new(response).slot_count(), Err(Error::MalformedFrame(_))));
}
