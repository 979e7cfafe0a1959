// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Typed encode/decode for the fixed-width binary fields that make up the
//! device's parameter memory. Every codec reads and writes exactly
//! [Codec::size] bytes of 7-bit-safe data.

use super::atoms::SchemaError;
use core::fmt;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// A decoded field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    #[allow(missing_docs)]
    Bool(bool),
    #[allow(missing_docs)]
    Int(i64),
    #[allow(missing_docs)]
    Float(f64),
    #[allow(missing_docs)]
    Text(String),
    /// Placeholder for structs and reserved ranges.
    Empty,
}
impl Value {
    /// The numeric reading of this value, if it has one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "ON" } else { "OFF" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Empty => write!(f, "-"),
        }
    }
}

/// Things that can go wrong while encoding or decoding a single field.
/// These are logic errors: with a valid schema and a well-typed caller they
/// do not occur at runtime.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The caller handed a value of the wrong variant to a codec.
    #[error("{codec} expected a {expected} value, got {actual:?}")]
    WrongType {
        #[allow(missing_docs)]
        codec: String,
        #[allow(missing_docs)]
        expected: &'static str,
        #[allow(missing_docs)]
        actual: Value,
    },
    /// An enum codec met a label or code outside its fixed mapping.
    #[error("{codec} has no mapping for {value}")]
    UnknownEnumValue {
        #[allow(missing_docs)]
        codec: String,
        #[allow(missing_docs)]
        value: String,
    },
    /// The buffer slice handed to the codec is shorter than its size.
    #[error("{codec} needs {needed} bytes, buffer has {available}")]
    BufferTooSmall {
        #[allow(missing_docs)]
        codec: String,
        #[allow(missing_docs)]
        needed: usize,
        #[allow(missing_docs)]
        available: usize,
    },
}

/// The codec contract: a fixed size, a value in, a value out.
///
/// Codecs are object-safe so that field definitions can own arbitrary codecs
/// behind one pointer, and so that decorators like [RemappedField] can wrap
/// any numeric codec by composition.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Encoded size in bytes.
    fn size(&self) -> usize;
    /// Human-readable summary of the encoding, e.g. a value range.
    fn description(&self) -> String;
    /// The value this codec contributes before any data has been read.
    fn empty_value(&self) -> Value;
    /// Writes `value` into the first [Codec::size] bytes of `buf`.
    fn encode(&self, value: &Value, buf: &mut [u8]) -> Result<(), CodecError>;
    /// Reads a value from the first [Codec::size] bytes of `buf`.
    fn decode(&self, buf: &[u8]) -> Result<Value, CodecError>;
}

/// A codec over a numeric domain. Encoding clamps to `[min, max]`, rounds to
/// the nearest integer in the *encoded* domain, and writes big-endian 7-bit
/// groups; decoding inverts exactly, so `decode(encode(v)) == v` for any `v`
/// representable at [NumericCodec::step] granularity.
///
/// Every `NumericCodec` is automatically a [Codec] through the blanket impl
/// below.
pub trait NumericCodec: fmt::Debug + Send + Sync {
    /// Encoded size in bytes.
    fn size(&self) -> usize;
    #[allow(missing_docs)]
    fn description(&self) -> String;
    /// Smallest decoded value.
    fn min(&self) -> f64;
    /// Largest decoded value.
    fn max(&self) -> f64;
    /// Distance between adjacent decoded values.
    fn step(&self) -> f64 {
        1.0
    }
    #[allow(missing_docs)]
    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError>;
    #[allow(missing_docs)]
    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError>;
}
impl<T: NumericCodec> Codec for T {
    fn size(&self) -> usize {
        NumericCodec::size(self)
    }

    fn description(&self) -> String {
        NumericCodec::description(self)
    }

    fn empty_value(&self) -> Value {
        number_value(self.min(), self.step())
    }

    fn encode(&self, value: &Value, buf: &mut [u8]) -> Result<(), CodecError> {
        let n = value.as_number().ok_or_else(|| CodecError::WrongType {
            codec: NumericCodec::description(self),
            expected: "numeric",
            actual: value.clone(),
        })?;
        self.encode_number(n, buf)
    }

    fn decode(&self, buf: &[u8]) -> Result<Value, CodecError> {
        Ok(number_value(self.decode_number(buf)?, self.step()))
    }
}

/// Values from integer-stepped codecs surface as [Value::Int]; fractional
/// steps surface as [Value::Float].
fn number_value(n: f64, step: f64) -> Value {
    if step.fract() == 0.0 {
        Value::Int(n.round() as i64)
    } else {
        Value::Float(n)
    }
}

fn check_len(codec: &dyn fmt::Debug, needed: usize, buf_len: usize) -> Result<(), CodecError> {
    if buf_len < needed {
        Err(CodecError::BufferTooSmall {
            codec: format!("{codec:?}"),
            needed,
            available: buf_len,
        })
    } else {
        Ok(())
    }
}

/// Writes `value` as `buf.len()` big-endian 7-bit groups.
fn write_groups(value: u32, buf: &mut [u8]) {
    let n = buf.len();
    for (index, byte) in buf.iter_mut().enumerate() {
        *byte = ((value >> (7 * (n - 1 - index))) & 0x7F) as u8;
    }
}

/// Reads `buf` as big-endian 7-bit groups.
fn read_groups(buf: &[u8]) -> u32 {
    buf.iter().fold(0u32, |acc, &b| (acc << 7) | u32::from(b & 0x7F))
}

/// One byte; bit 0 is the value.
#[derive(Debug, Default)]
pub struct BoolField;
impl Codec for BoolField {
    fn size(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        "OFF/ON".to_string()
    }

    fn empty_value(&self) -> Value {
        Value::Bool(false)
    }

    fn encode(&self, value: &Value, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, 1, buf.len())?;
        match value {
            Value::Bool(b) => {
                buf[0] = u8::from(*b);
                Ok(())
            }
            _ => Err(CodecError::WrongType {
                codec: self.description(),
                expected: "bool",
                actual: value.clone(),
            }),
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<Value, CodecError> {
        check_len(self, 1, buf.len())?;
        Ok(Value::Bool(buf[0] & 0x01 != 0))
    }
}

/// Fixed-length ASCII, space-padded on encode and right-trimmed on decode.
/// Characters outside the printable range become `?`.
#[derive(Debug)]
pub struct AsciiField {
    len: usize,
}
impl AsciiField {
    #[allow(missing_docs)]
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}
impl Codec for AsciiField {
    fn size(&self) -> usize {
        self.len
    }

    fn description(&self) -> String {
        format!("ascii[{}]", self.len)
    }

    fn empty_value(&self) -> Value {
        Value::Text(String::new())
    }

    fn encode(&self, value: &Value, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, self.len, buf.len())?;
        let s = value.as_text().ok_or_else(|| CodecError::WrongType {
            codec: self.description(),
            expected: "text",
            actual: value.clone(),
        })?;
        let mut chars = s.chars();
        for byte in buf.iter_mut().take(self.len) {
            *byte = match chars.next() {
                None => b' ',
                Some(c) if (0x20..=0x7E).contains(&(c as u32)) => c as u8,
                Some(_) => b'?',
            };
        }
        Ok(())
    }

    fn decode(&self, buf: &[u8]) -> Result<Value, CodecError> {
        check_len(self, self.len, buf.len())?;
        let s: String = buf[..self.len]
            .iter()
            .map(|&b| {
                if (0x20..=0x7E).contains(&b) {
                    b as char
                } else {
                    '?'
                }
            })
            .collect();
        Ok(Value::Text(s.trim_end().to_string()))
    }
}

/// Padding bytes the device documents but the controller never interprets.
#[derive(Debug)]
pub struct ReservedField {
    len: usize,
}
impl ReservedField {
    #[allow(missing_docs)]
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}
impl Codec for ReservedField {
    fn size(&self) -> usize {
        self.len
    }

    fn description(&self) -> String {
        format!("reserved[{}]", self.len)
    }

    fn empty_value(&self) -> Value {
        Value::Empty
    }

    fn encode(&self, value: &Value, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, self.len, buf.len())?;
        match value {
            Value::Empty => {
                buf[..self.len].fill(0);
                Ok(())
            }
            _ => Err(CodecError::WrongType {
                codec: self.description(),
                expected: "empty",
                actual: value.clone(),
            }),
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<Value, CodecError> {
        check_len(self, self.len, buf.len())?;
        Ok(Value::Empty)
    }
}

fn encode_unsigned(
    codec: &dyn fmt::Debug,
    min: u32,
    max: u32,
    groups: usize,
    value: f64,
    buf: &mut [u8],
) -> Result<(), CodecError> {
    check_len(codec, groups, buf.len())?;
    let clamped = value.clamp(min as f64, max as f64).round() as u32;
    write_groups(clamped, &mut buf[..groups]);
    Ok(())
}

fn decode_unsigned(
    codec: &dyn fmt::Debug,
    groups: usize,
    buf: &[u8],
) -> Result<f64, CodecError> {
    check_len(codec, groups, buf.len())?;
    Ok(f64::from(read_groups(&buf[..groups])))
}

/// Unsigned value in a single 7-bit group.
#[derive(Debug)]
pub struct UByteField {
    min: u32,
    max: u32,
}
impl UByteField {
    #[allow(missing_docs)]
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}
impl Default for UByteField {
    fn default() -> Self {
        Self { min: 0, max: 0x7F }
    }
}
impl NumericCodec for UByteField {
    fn size(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        format!("{}..={}", self.min, self.max)
    }

    fn min(&self) -> f64 {
        self.min as f64
    }

    fn max(&self) -> f64 {
        self.max as f64
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        encode_unsigned(self, self.min, self.max, 1, value, buf)
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        decode_unsigned(self, 1, buf)
    }
}

/// Unsigned value in two big-endian 7-bit groups.
#[derive(Debug)]
pub struct UWordField {
    min: u32,
    max: u32,
}
impl UWordField {
    #[allow(missing_docs)]
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}
impl Default for UWordField {
    fn default() -> Self {
        Self {
            min: 0,
            max: 0x3FFF,
        }
    }
}
impl NumericCodec for UWordField {
    fn size(&self) -> usize {
        2
    }

    fn description(&self) -> String {
        format!("{}..={}", self.min, self.max)
    }

    fn min(&self) -> f64 {
        self.min as f64
    }

    fn max(&self) -> f64 {
        self.max as f64
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        encode_unsigned(self, self.min, self.max, 2, value, buf)
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        decode_unsigned(self, 2, buf)
    }
}

/// Unsigned value in three big-endian 7-bit groups.
#[derive(Debug)]
pub struct U3BytesField {
    min: u32,
    max: u32,
}
impl U3BytesField {
    #[allow(missing_docs)]
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}
impl Default for U3BytesField {
    fn default() -> Self {
        Self {
            min: 0,
            max: 0x1F_FFFF,
        }
    }
}
impl NumericCodec for U3BytesField {
    fn size(&self) -> usize {
        3
    }

    fn description(&self) -> String {
        format!("{}..={}", self.min, self.max)
    }

    fn min(&self) -> f64 {
        self.min as f64
    }

    fn max(&self) -> f64 {
        self.max as f64
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        encode_unsigned(self, self.min, self.max, 3, value, buf)
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        decode_unsigned(self, 3, buf)
    }
}

/// Centered parameter stored as `value + 64` over the full 0..=127 byte.
#[derive(Debug, Default)]
pub struct C64Field;
impl NumericCodec for C64Field {
    fn size(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        "-64..=+63".to_string()
    }

    fn min(&self) -> f64 {
        -64.0
    }

    fn max(&self) -> f64 {
        63.0
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, 1, buf.len())?;
        buf[0] = (value.clamp(self.min(), self.max()).round() + 64.0) as u8;
        Ok(())
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        check_len(self, 1, buf.len())?;
        Ok(f64::from(buf[0] & 0x7F) - 64.0)
    }
}

/// Centered parameter whose encoded range is 1..=127; the device clamps an
/// encoded 0 up to 1, and decoding mirrors that.
#[derive(Debug, Default)]
pub struct C63Field;
impl NumericCodec for C63Field {
    fn size(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        "-63..=+63".to_string()
    }

    fn min(&self) -> f64 {
        -63.0
    }

    fn max(&self) -> f64 {
        63.0
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, 1, buf.len())?;
        buf[0] = (value.clamp(self.min(), self.max()).round() + 64.0) as u8;
        Ok(())
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        check_len(self, 1, buf.len())?;
        Ok(f64::from((buf[0] & 0x7F).max(1)) - 64.0)
    }
}

/// Like [C63Field], but encoded 0 is the reserved OFF position. OFF decodes
/// to [C63OffField::OFF], one step below the normal range.
#[derive(Debug, Default)]
pub struct C63OffField;
impl C63OffField {
    /// The decoded sentinel for the OFF position.
    pub const OFF: f64 = -64.0;
}
impl NumericCodec for C63OffField {
    fn size(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        "OFF, -63..=+63".to_string()
    }

    fn min(&self) -> f64 {
        -63.0
    }

    fn max(&self) -> f64 {
        63.0
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, 1, buf.len())?;
        buf[0] = if value < self.min() {
            0
        } else {
            (value.clamp(self.min(), self.max()).round() + 64.0) as u8
        };
        Ok(())
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        check_len(self, 1, buf.len())?;
        let encoded = buf[0] & 0x7F;
        Ok(if encoded == 0 {
            Self::OFF
        } else {
            f64::from(encoded) - 64.0
        })
    }
}

/// An 8-bit value split into two nibbles, high nibble first.
#[derive(Debug, Default)]
pub struct USplit8Field;
impl NumericCodec for USplit8Field {
    fn size(&self) -> usize {
        2
    }

    fn description(&self) -> String {
        "0..=255 (nibbles)".to_string()
    }

    fn min(&self) -> f64 {
        0.0
    }

    fn max(&self) -> f64 {
        255.0
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, 2, buf.len())?;
        let v = value.clamp(self.min(), self.max()).round() as u16;
        buf[0] = ((v >> 4) & 0x0F) as u8;
        buf[1] = (v & 0x0F) as u8;
        Ok(())
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        check_len(self, 2, buf.len())?;
        Ok(f64::from(
            (u16::from(buf[0] & 0x0F) << 4) | u16::from(buf[1] & 0x0F),
        ))
    }
}

/// A 12-bit value split into three nibbles, high nibble first.
#[derive(Debug, Default)]
pub struct USplit12Field;
impl NumericCodec for USplit12Field {
    fn size(&self) -> usize {
        3
    }

    fn description(&self) -> String {
        "0..=4095 (nibbles)".to_string()
    }

    fn min(&self) -> f64 {
        0.0
    }

    fn max(&self) -> f64 {
        4095.0
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        check_len(self, 3, buf.len())?;
        let v = value.clamp(self.min(), self.max()).round() as u16;
        buf[0] = ((v >> 8) & 0x0F) as u8;
        buf[1] = ((v >> 4) & 0x0F) as u8;
        buf[2] = (v & 0x0F) as u8;
        Ok(())
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        check_len(self, 3, buf.len())?;
        Ok(f64::from(
            (u16::from(buf[0] & 0x0F) << 8)
                | (u16::from(buf[1] & 0x0F) << 4)
                | u16::from(buf[2] & 0x0F),
        ))
    }
}

/// A bidirectional label↔code mapping over a raw numeric codec.
///
/// The label set is fixed and validated at construction; meeting an unmapped
/// label or code later is a fatal coding error, not a recoverable condition.
#[derive(Debug)]
pub struct EnumField {
    raw: Box<dyn NumericCodec>,
    labels: Vec<(String, u32)>,
    by_label: FxHashMap<String, u32>,
    by_code: FxHashMap<u32, usize>,
}
impl EnumField {
    /// Builds an enum over `raw` from `(label, code)` pairs.
    pub fn new(
        raw: impl NumericCodec + 'static,
        labels: &[(&str, u32)],
    ) -> Result<Self, SchemaError> {
        if labels.is_empty() {
            return Err(SchemaError::EmptyEnum {
                codec: NumericCodec::description(&raw),
            });
        }
        let mut by_label = FxHashMap::default();
        let mut by_code = FxHashMap::default();
        let mut owned = Vec::with_capacity(labels.len());
        for (index, (label, code)) in labels.iter().enumerate() {
            let as_number = f64::from(*code);
            if as_number < raw.min() || as_number > raw.max() {
                return Err(SchemaError::EnumCodeOutOfRange {
                    codec: NumericCodec::description(&raw),
                    label: label.to_string(),
                    code: *code,
                });
            }
            if by_label.insert(label.to_string(), *code).is_some() {
                return Err(SchemaError::DuplicateEnumLabel {
                    codec: NumericCodec::description(&raw),
                    label: label.to_string(),
                });
            }
            by_code.entry(*code).or_insert(index);
            owned.push((label.to_string(), *code));
        }
        Ok(Self {
            raw: Box::new(raw),
            labels: owned,
            by_label,
            by_code,
        })
    }

    /// The labels in construction order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|(label, _)| label.as_str())
    }
}
impl Codec for EnumField {
    fn size(&self) -> usize {
        self.raw.size()
    }

    fn description(&self) -> String {
        let labels: Vec<&str> = self.labels().collect();
        labels.join("/")
    }

    fn empty_value(&self) -> Value {
        Value::Text(self.labels[0].0.clone())
    }

    fn encode(&self, value: &Value, buf: &mut [u8]) -> Result<(), CodecError> {
        let label = value.as_text().ok_or_else(|| CodecError::WrongType {
            codec: self.description(),
            expected: "text",
            actual: value.clone(),
        })?;
        let code = self
            .by_label
            .get(label)
            .ok_or_else(|| CodecError::UnknownEnumValue {
                codec: self.description(),
                value: label.to_string(),
            })?;
        self.raw.encode_number(f64::from(*code), buf)
    }

    fn decode(&self, buf: &[u8]) -> Result<Value, CodecError> {
        let code = self.raw.decode_number(buf)?.round() as u32;
        let index = self
            .by_code
            .get(&code)
            .ok_or_else(|| CodecError::UnknownEnumValue {
                codec: self.description(),
                value: code.to_string(),
            })?;
        Ok(Value::Text(self.labels[*index].0.clone()))
    }
}

/// Decorator composing a numeric codec with an affine transform:
/// `decoded = (encoded − encoded_offset) × decoded_factor`. Size is
/// preserved, round-trips hold, and the decoded range can be overridden for
/// display purposes.
#[derive(Debug)]
pub struct RemappedField {
    inner: Box<dyn NumericCodec>,
    encoded_offset: f64,
    decoded_factor: f64,
    min: Option<f64>,
    max: Option<f64>,
    description: Option<String>,
}
impl RemappedField {
    #[allow(missing_docs)]
    pub fn new(
        inner: impl NumericCodec + 'static,
        encoded_offset: f64,
        decoded_factor: f64,
    ) -> Self {
        Self {
            inner: Box::new(inner),
            encoded_offset,
            decoded_factor,
            min: None,
            max: None,
            description: None,
        }
    }

    /// Overrides the decoded range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Overrides the displayed description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn remap(&self, encoded: f64) -> f64 {
        (encoded - self.encoded_offset) * self.decoded_factor
    }
}
impl NumericCodec for RemappedField {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("{}..={}", self.min(), self.max()))
    }

    fn min(&self) -> f64 {
        self.min.unwrap_or_else(|| {
            self.remap(self.inner.min())
                .min(self.remap(self.inner.max()))
        })
    }

    fn max(&self) -> f64 {
        self.max.unwrap_or_else(|| {
            self.remap(self.inner.min())
                .max(self.remap(self.inner.max()))
        })
    }

    fn step(&self) -> f64 {
        self.inner.step() * self.decoded_factor.abs()
    }

    fn encode_number(&self, value: f64, buf: &mut [u8]) -> Result<(), CodecError> {
        let clamped = value.clamp(self.min(), self.max());
        let encoded = clamped / self.decoded_factor + self.encoded_offset;
        self.inner.encode_number(encoded, buf)
    }

    fn decode_number(&self, buf: &[u8]) -> Result<f64, CodecError> {
        Ok(self.remap(self.inner.decode_number(buf)?))
    }
}
