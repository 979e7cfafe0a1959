// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The Roland GR-55 guitar synthesizer: its device model and the slices of
//! its parameter map this crate ships.
//!
//! The map is deliberately partial. It covers the system common block and
//! the patch common block, which between them exercise every codec family;
//! hosts needing deeper coverage extend these tables from the GR-55 MIDI
//! implementation chart, converting each printed address with
//! [pack7](crate::sysex::pack7).

use crate::schema::{
    AsciiField, Atom, BoolField, C63Field, C63OffField, C64Field, EnumField, FieldDefinition,
    RemappedField, ReservedField, StructDefinition, U3BytesField, UByteField, USplit12Field,
    USplit8Field, UWordField,
};
use crate::sysex::{pack7, DeviceModel};
use crate::types::DeviceAddress;
use once_cell::sync::Lazy;

/// The GR-55's wire dialect: Roland manufacturer id, the three-byte model id
/// it answers RQ1/DT1 under, and four-byte addresses.
pub static GR55: DeviceModel = DeviceModel {
    manufacturer: 0x41,
    model_id: &[0x00, 0x00, 0x53],
    address_bytes: 4,
    family_code: 0x0153,
    description: "Roland GR-55",
};

/// Base address of the system block.
pub const SYSTEM_BASE: DeviceAddress = DeviceAddress::new(0);

/// Base address of the temporary patch's common block, `18 00 00 00` in the
/// implementation chart's notation.
pub static PATCH_COMMON_BASE: Lazy<DeviceAddress> = Lazy::new(|| {
    DeviceAddress::new(pack7(0x1800_0000, 4).expect("chart address has clear high bits"))
});

/// System block: global settings that survive patch changes.
///
/// The common and MIDI sub-blocks sit apart in address space, so a read of
/// the whole system block coalesces into one request per sub-block.
pub static SYSTEM: Lazy<Atom> = Lazy::new(|| {
    Atom::Struct(
        StructDefinition::new(
            0,
            "system",
            vec![
                (
                    "common",
                    Atom::Struct(
                        StructDefinition::new(
                            0,
                            "system common",
                            vec![
                                (
                                    "master_tune",
                                    Atom::Field(FieldDefinition::new(
                                        0x00,
                                        "master tune",
                                        RemappedField::new(USplit12Field, -3376.0, 0.1)
                                            .with_range(415.3, 466.2)
                                            .with_description("415.3Hz..=466.2Hz"),
                                    )),
                                ),
                                (
                                    "master_level",
                                    Atom::Field(FieldDefinition::new(
                                        0x03,
                                        "master level",
                                        UByteField::default(),
                                    )),
                                ),
                                (
                                    "lcd_contrast",
                                    Atom::Field(FieldDefinition::new(
                                        0x04,
                                        "LCD contrast",
                                        UByteField::new(1, 16),
                                    )),
                                ),
                                (
                                    "reserved",
                                    Atom::Field(FieldDefinition::new(
                                        0x05,
                                        "(reserved)",
                                        ReservedField::new(3),
                                    )),
                                ),
                            ],
                        )
                        .expect("system common layout"),
                    ),
                ),
                (
                    "midi",
                    Atom::Struct(
                        StructDefinition::new(
                            0x10,
                            "system MIDI",
                            vec![
                                (
                                    "rx_channel",
                                    Atom::Field(FieldDefinition::new(
                                        0x00,
                                        "receive channel",
                                        UByteField::new(0, 15),
                                    )),
                                ),
                                (
                                    "omni_mode",
                                    Atom::Field(FieldDefinition::new(
                                        0x01,
                                        "omni mode",
                                        BoolField,
                                    )),
                                ),
                                (
                                    "clock_source",
                                    Atom::Field(FieldDefinition::new(
                                        0x02,
                                        "clock source",
                                        EnumField::new(
                                            UByteField::default(),
                                            &[("auto", 0), ("internal", 1)],
                                        )
                                        .expect("clock source labels"),
                                    )),
                                ),
                            ],
                        )
                        .expect("system MIDI layout"),
                    ),
                ),
            ],
        )
        .expect("system layout"),
    )
});

/// Patch common block: the per-patch settings shared by every tone.
pub static PATCH_COMMON: Lazy<Atom> = Lazy::new(|| {
    Atom::Struct(
        StructDefinition::new(
            0,
            "patch common",
            vec![
                (
                    "name",
                    Atom::Field(FieldDefinition::new(0x00, "patch name", AsciiField::new(16))),
                ),
                (
                    "level",
                    Atom::Field(FieldDefinition::new(
                        0x10,
                        "patch level",
                        UByteField::default(),
                    )),
                ),
                (
                    "pan",
                    Atom::Field(FieldDefinition::new(0x11, "pan", C64Field)),
                ),
                (
                    "fine_tune",
                    Atom::Field(FieldDefinition::new(0x12, "fine tune", C63Field)),
                ),
                (
                    "dynamics",
                    Atom::Field(FieldDefinition::new(0x13, "dynamics", C63OffField)),
                ),
                (
                    "tempo",
                    Atom::Field(FieldDefinition::new(
                        0x14,
                        "patch tempo",
                        RemappedField::new(USplit12Field, 0.0, 0.1)
                            .with_range(20.0, 250.0)
                            .with_description("20.0..=250.0 BPM"),
                    )),
                ),
                (
                    "alt_tuning",
                    Atom::Field(FieldDefinition::new(
                        0x17,
                        "alternate tuning",
                        EnumField::new(
                            UByteField::default(),
                            &[
                                ("open-d", 0),
                                ("open-e", 1),
                                ("open-g", 2),
                                ("open-a", 3),
                                ("drop-d", 4),
                                ("d-modal", 5),
                                ("nashville", 6),
                                ("12-string", 7),
                            ],
                        )
                        .expect("alternate tuning labels"),
                    )),
                ),
                (
                    "amp_on",
                    Atom::Field(FieldDefinition::new(0x18, "amp on", BoolField)),
                ),
                (
                    "reserved",
                    Atom::Field(FieldDefinition::new(0x19, "(reserved)", ReservedField::new(2))),
                ),
                (
                    "effect_level",
                    Atom::Field(FieldDefinition::new(
                        0x1B,
                        "effect level",
                        USplit8Field,
                    )),
                ),
                (
                    "pcm1",
                    Atom::Struct(
                        StructDefinition::new(
                            0x20,
                            "PCM tone 1",
                            vec![
                                (
                                    "tone_number",
                                    Atom::Field(FieldDefinition::new(
                                        0x00,
                                        "tone number",
                                        U3BytesField::default(),
                                    )),
                                ),
                                (
                                    "level",
                                    Atom::Field(FieldDefinition::new(
                                        0x03,
                                        "tone level",
                                        UByteField::default(),
                                    )),
                                ),
                                (
                                    "attack_offset",
                                    Atom::Field(FieldDefinition::new(
                                        0x04,
                                        "attack offset",
                                        UWordField::default(),
                                    )),
                                ),
                            ],
                        )
                        .expect("PCM tone layout"),
                    ),
                ),
            ],
        )
        .expect("patch common layout"),
    )
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;
    use float_cmp::approx_eq;

    fn field_reference(root: &Atom, base: DeviceAddress, name: &str) -> crate::schema::FieldReference {
        let Atom::Struct(s) = root else {
            panic!("root must be a struct");
        };
        s.field_reference(base, name).expect("field exists")
    }

    #[test]
    fn patch_common_base_folds_the_chart_address() {
        // 18 00 00 00 on the wire is 0x18 << 21 dense.
        assert_eq!(PATCH_COMMON_BASE.0, 0x18 << 21);
    }

    #[test]
    fn system_layout_is_sound() {
        assert_eq!(SYSTEM.size(), 0x13);
        assert!(
            !SYSTEM.is_contiguous(),
            "the MIDI block sits past a gap, so the system block cannot be \
             fetched in one request"
        );
        let Atom::Struct(s) = &*SYSTEM else {
            panic!("system root must be a struct");
        };
        assert!(s.member("common").is_some_and(|m| m.is_contiguous()));
        assert!(s.member("midi").is_some_and(|m| m.is_contiguous()));
    }

    #[test]
    fn patch_common_layout_is_sound() {
        assert_eq!(PATCH_COMMON.size(), 0x26);
        let Atom::Struct(s) = &*PATCH_COMMON else {
            panic!("patch common root must be a struct");
        };
        // Contiguous through effect_level, then a gap before pcm1.
        assert!(!PATCH_COMMON.is_contiguous());
        assert_eq!(s.member("name").unwrap().size(), 16);
        assert_eq!(s.member("pcm1").unwrap().offset(), 0x20);
    }

    #[test]
    fn master_tune_concert_pitch_hits_the_chart_value() {
        let Atom::Struct(system) = &*SYSTEM else {
            panic!();
        };
        let Some(Atom::Struct(common)) = system.member("common") else {
            panic!();
        };
        let tune = common
            .field_reference(SYSTEM_BASE, "master_tune")
            .expect("master_tune");
        let mut buf = vec![0u8; tune.codec.size()];
        tune.codec.encode(&Value::Float(440.0), &mut buf).unwrap();
        // 440.0 Hz encodes as 1024, nibble-split high first.
        assert_eq!(buf, vec![0x04, 0x00, 0x00]);
        let Value::Float(decoded) = tune.codec.decode(&buf).unwrap() else {
            panic!("master tune decodes as a float");
        };
        assert!(approx_eq!(f64, decoded, 440.0, epsilon = 1e-9));
    }

    #[test]
    fn alternate_tuning_rejects_unknown_labels() {
        let reference =
            field_reference(&PATCH_COMMON, *PATCH_COMMON_BASE, "alt_tuning");
        let mut buf = vec![0u8; reference.codec.size()];
        assert!(reference
            .codec
            .encode(&Value::Text("ukulele".to_string()), &mut buf)
            .is_err());
        assert!(reference
            .codec
            .encode(&Value::Text("drop-d".to_string()), &mut buf)
            .is_ok());
        assert_eq!(buf, vec![4]);
    }

    #[test]
    fn every_patch_common_address_is_absolute() {
        let references = PATCH_COMMON.addresses(*PATCH_COMMON_BASE);
        assert_eq!(references[0].address, *PATCH_COMMON_BASE);
        let name = references
            .iter()
            .find(|r| r.atom.description() == "patch name")
            .expect("name field present");
        assert_eq!(name.address, *PATCH_COMMON_BASE);
        let tone_number = references
            .iter()
            .find(|r| r.atom.description() == "tone number")
            .expect("tone number present");
        assert_eq!(tone_number.address, PATCH_COMMON_BASE.offset_by(0x20));
    }
}
