// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The SysEx wire protocol: framing, checksums, 7-bit packing, and the
//! Roland data-request (RQ1) / data-set (DT1) message pair.

use crate::types::{DeviceAddress, DeviceIdentity};
use thiserror::Error;

/// Start of a System Exclusive frame.
pub const SYSEX_START: u8 = 0xF0;
/// End of a System Exclusive frame.
pub const SYSEX_END: u8 = 0xF7;
/// Roland's manufacturer id.
pub const MANUFACTURER_ROLAND: u8 = 0x41;

/// Roland data-request command (RQ1).
pub const COMMAND_RQ1: u8 = 0x11;
/// Roland data-set command (DT1).
pub const COMMAND_DT1: u8 = 0x12;

const UNIVERSAL_NON_REALTIME: u8 = 0x7E;
const BROADCAST_DEVICE_ID: u8 = 0x7F;
const GENERAL_INFORMATION: u8 = 0x06;
const IDENTITY_REQUEST: u8 = 0x01;
const IDENTITY_REPLY: u8 = 0x02;

/// Things that can go wrong while preparing bytes for the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A byte destined for a MIDI data position has its high bit set.
    #[error("byte {index} of {value:#010x} has its high bit set")]
    HighBitSet {
        #[allow(missing_docs)]
        value: u32,
        #[allow(missing_docs)]
        index: usize,
    },
}

/// Describes one family of Roland hardware well enough to build and
/// recognize its data-transfer frames.
#[derive(Debug)]
pub struct DeviceModel {
    /// Manufacturer id, first byte after the frame start.
    pub manufacturer: u8,
    /// The model id bytes that follow the device id.
    pub model_id: &'static [u8],
    /// How many wire bytes an address (and a length) occupies.
    pub address_bytes: usize,
    /// Family code reported in the identity reply.
    pub family_code: u16,
    #[allow(missing_docs)]
    pub description: &'static str,
}

/// The value that makes the sum of `bytes` plus itself divisible by 128.
pub fn roland_checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    ((128 - (sum % 128)) & 0x7F) as u8
}

/// True if `checksum` closes the sum over `bytes` to a multiple of 128.
pub fn is_valid_checksum(bytes: &[u8], checksum: u8) -> bool {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    (sum + u32::from(checksum)) % 128 == 0
}

/// Converts an address written as a familiar hex literal (`0x1800_0000`,
/// one device byte per 8 bits, high bits all clear) into the dense form
/// used for arithmetic. Fails if any literal byte has its high bit set,
/// since such a byte could never appear on the wire.
pub fn pack7(literal: u32, num_bytes: usize) -> Result<u32, WireError> {
    let mut dense = 0u32;
    for index in 0..num_bytes {
        let byte = (literal >> (8 * (num_bytes - 1 - index))) & 0xFF;
        if byte & 0x80 != 0 {
            return Err(WireError::HighBitSet {
                value: literal,
                index,
            });
        }
        dense = (dense << 7) | byte;
    }
    Ok(dense)
}

/// Serializes a dense value as `num_bytes` big-endian 7-bit wire bytes.
pub fn unpack7(dense: u32, num_bytes: usize) -> Vec<u8> {
    (0..num_bytes)
        .map(|index| ((dense >> (7 * (num_bytes - 1 - index))) & 0x7F) as u8)
        .collect()
}

/// Builds an RQ1 frame asking for `length` bytes at `address`.
pub fn data_request_frame(
    model: &DeviceModel,
    device_id: u8,
    address: DeviceAddress,
    length: u32,
) -> Vec<u8> {
    let mut frame = vec![SYSEX_START, model.manufacturer, device_id];
    frame.extend_from_slice(model.model_id);
    frame.push(COMMAND_RQ1);
    let body_start = frame.len();
    frame.extend(unpack7(address.0, model.address_bytes));
    frame.extend(unpack7(length, model.address_bytes));
    let checksum = roland_checksum(&frame[body_start..]);
    frame.push(checksum);
    frame.push(SYSEX_END);
    frame
}

/// Builds a DT1 frame writing `value` at `address`.
pub fn data_set_frame(
    model: &DeviceModel,
    device_id: u8,
    address: DeviceAddress,
    value: &[u8],
) -> Vec<u8> {
    let mut frame = vec![SYSEX_START, model.manufacturer, device_id];
    frame.extend_from_slice(model.model_id);
    frame.push(COMMAND_DT1);
    let body_start = frame.len();
    frame.extend(unpack7(address.0, model.address_bytes));
    frame.extend_from_slice(value);
    let checksum = roland_checksum(&frame[body_start..]);
    frame.push(checksum);
    frame.push(SYSEX_END);
    frame
}

/// A parsed DT1 frame. The checksum has been extracted but deliberately not
/// yet verified: matching a frame against pending fetches is cheap, and only
/// a frame that actually matters is worth summing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSetFrame {
    #[allow(missing_docs)]
    pub device_id: u8,
    #[allow(missing_docs)]
    pub address: DeviceAddress,
    /// Everything between the address field and the trailing checksum.
    pub value: Vec<u8>,
    #[allow(missing_docs)]
    pub checksum: u8,
}
impl DataSetFrame {
    /// The deferred checksum verification.
    pub fn has_valid_checksum(&self, model: &DeviceModel) -> bool {
        let mut body = unpack7(self.address.0, model.address_bytes);
        body.extend_from_slice(&self.value);
        is_valid_checksum(&body, self.checksum)
    }
}

/// Parses a DT1 frame from `model`'s family. Returns `None` for anything
/// that doesn't match; a foreign frame is not an error, it just belongs to
/// somebody else.
pub fn parse_data_set(model: &DeviceModel, frame: &[u8]) -> Option<DataSetFrame> {
    parse_data_frame(model, COMMAND_DT1, frame)
}

/// Parses an RQ1 frame. The controller itself never receives these, but a
/// device simulator answering our requests does.
pub fn parse_data_request(model: &DeviceModel, frame: &[u8]) -> Option<DataSetFrame> {
    parse_data_frame(model, COMMAND_RQ1, frame)
}

fn parse_data_frame(model: &DeviceModel, command: u8, frame: &[u8]) -> Option<DataSetFrame> {
    let header_len = 4 + model.model_id.len();
    // header + address + checksum + end
    if frame.len() < header_len + model.address_bytes + 2 {
        return None;
    }
    if frame[0] != SYSEX_START || frame[1] != model.manufacturer {
        return None;
    }
    if &frame[3..3 + model.model_id.len()] != model.model_id {
        return None;
    }
    if frame[header_len - 1] != command || frame[frame.len() - 1] != SYSEX_END {
        return None;
    }
    let address = frame[header_len..header_len + model.address_bytes]
        .iter()
        .fold(0u32, |acc, &b| (acc << 7) | u32::from(b & 0x7F));
    let value = frame[header_len + model.address_bytes..frame.len() - 2].to_vec();
    Some(DataSetFrame {
        device_id: frame[2],
        address: DeviceAddress(address),
        value,
        checksum: frame[frame.len() - 2],
    })
}

/// The fixed universal identity-request broadcast.
pub fn identity_request_frame() -> [u8; 6] {
    [
        SYSEX_START,
        UNIVERSAL_NON_REALTIME,
        BROADCAST_DEVICE_ID,
        GENERAL_INFORMATION,
        IDENTITY_REQUEST,
        SYSEX_END,
    ]
}

/// Parses a universal identity reply. Family and model codes are 14-bit
/// little-endian pairs per the MIDI spec; the software revision is
/// accumulated from its four bytes and passed along unverified.
pub fn parse_identity_reply(frame: &[u8]) -> Option<DeviceIdentity> {
    if frame.len() < 15 {
        return None;
    }
    if frame[0] != SYSEX_START
        || frame[1] != UNIVERSAL_NON_REALTIME
        || frame[3] != GENERAL_INFORMATION
        || frame[4] != IDENTITY_REPLY
    {
        return None;
    }
    let device_family = u16::from(frame[6]) | (u16::from(frame[7]) << 7);
    let device_model = u16::from(frame[8]) | (u16::from(frame[9]) << 7);
    let software_revision_level = frame[10..14]
        .iter()
        .fold(0u32, |acc, &b| (acc << 7) | u32::from(b & 0x7F));
    Some(DeviceIdentity {
        manufacturer_id: frame[5],
        device_id: frame[2],
        device_family,
        device_model,
        software_revision_level,
    })
}
