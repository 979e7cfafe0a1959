// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Common data types used throughout the system.

use derive_more::Display as DeriveDisplay;
use serde::{Deserialize, Serialize};

/// Newtype for an address in the device's parameter memory.
///
/// Addresses are kept in dense form: each 7-bit wire byte contributes seven
/// bits, so ordinary integer arithmetic works for offsets and range lengths.
/// Use [pack7](crate::sysex::pack7) to turn the hex literals printed in
/// Roland's MIDI implementation charts into this form, and
/// [unpack7](crate::sysex::unpack7) to serialize back to wire bytes.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    DeriveDisplay,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[display(fmt = "{:08x}", _0)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceAddress(pub u32);
#[allow(missing_docs)]
impl DeviceAddress {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The address `offset` bytes past this one.
    pub const fn offset_by(&self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}
impl From<u32> for DeviceAddress {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
impl From<DeviceAddress> for u32 {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

/// Identifies one MIDI port on the host. The core never opens ports itself;
/// it only compares descriptors to notice when the host has switched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortDescriptor {
    #[allow(missing_docs)]
    pub index: usize,
    #[allow(missing_docs)]
    pub name: String,
}
impl PortDescriptor {
    #[allow(missing_docs)]
    pub fn new_with(index: usize, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
        }
    }
}

/// The live device configuration a request was issued against.
///
/// A pending fetch remembers the context it was sent under. If any part of
/// the context changes before the reply arrives (the user picked a different
/// port, or a different logical device), the reply can no longer be trusted
/// to belong to the request, and the fetch is cancelled instead.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceContext {
    /// The SysEx device id the unit responds to (Roland factory default 0x10).
    pub device_id: u8,
    /// The input port replies arrive on.
    pub input_port: Option<PortDescriptor>,
    /// The output port requests leave through.
    pub output_port: Option<PortDescriptor>,
    /// Host-defined key naming which logical device is selected, for hosts
    /// that multiplex several units over one port pair.
    pub selection: String,
}

/// A device's answer to the universal identity request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceIdentity {
    #[allow(missing_docs)]
    pub manufacturer_id: u8,
    #[allow(missing_docs)]
    pub device_id: u8,
    #[allow(missing_docs)]
    pub device_family: u16,
    #[allow(missing_docs)]
    pub device_model: u16,
    /// Carried as received. The GR-55 is known to report this field
    /// inconsistently, so don't make decisions based on it.
    pub software_revision_level: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_arithmetic_and_display() {
        let base = DeviceAddress::new(0x0060_0000);
        assert_eq!(base.offset_by(0x10), DeviceAddress::new(0x0060_0010));
        assert_eq!(base.to_string(), "00600000");
    }

    #[test]
    fn device_context_equality_covers_every_field() {
        let a = DeviceContext {
            device_id: 0x10,
            input_port: Some(PortDescriptor::new_with(0, "GR-55 IN")),
            output_port: Some(PortDescriptor::new_with(1, "GR-55 OUT")),
            selection: "gr55".to_string(),
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.selection = "gr55-b".to_string();
        assert_ne!(a, b, "selection key must participate in context equality");
    }
}
