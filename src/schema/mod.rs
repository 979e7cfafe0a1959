// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The declarative parameter map: codecs for the device's encoded field
//! formats, the atom tree that places them at addresses, and the bag
//! operations that parse, serialize, and fetch whole subtrees.

pub use atoms::{
    Atom, AtomReference, FieldDefinition, FieldReference, SchemaError, StructDefinition,
};
pub use bags::{
    fetch_and_parse, fetch_and_tokenize, parse, tokenize, FetchBytes, FetchHandle, ParsedDataBag,
    RawDataBag,
};
pub use fields::{
    AsciiField, BoolField, C63Field, C63OffField, C64Field, Codec, CodecError, EnumField,
    NumericCodec, RemappedField, ReservedField, U3BytesField, UByteField, USplit12Field,
    USplit8Field, UWordField, Value,
};

mod atoms;
mod bags;
mod fields;
