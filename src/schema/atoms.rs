// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The address map: a tree of structs and fields describing where every
//! parameter lives in device memory.

use super::fields::{Codec, CodecError};
use crate::types::DeviceAddress;
use std::sync::Arc;
use thiserror::Error;

/// Schema construction and traversal failures. Construction variants are
/// programming errors in the schema tables and surface the first time the
/// tables are built, never during normal operation.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A struct member is out of order or overlaps the member before it.
    #[error(
        "member {member} of {parent} at offset {offset:#x} overlaps or precedes \
         the previous member ending at {end:#x}"
    )]
    MemberOverlap {
        #[allow(missing_docs)]
        parent: String,
        #[allow(missing_docs)]
        member: String,
        #[allow(missing_docs)]
        offset: u32,
        #[allow(missing_docs)]
        end: u32,
    },
    /// An enum codec with no labels can never decode anything.
    #[error("enum {codec} must have at least one label")]
    EmptyEnum {
        #[allow(missing_docs)]
        codec: String,
    },
    /// Two labels mapping to the same name would make encoding ambiguous.
    #[error("enum {codec} defines label {label} twice")]
    DuplicateEnumLabel {
        #[allow(missing_docs)]
        codec: String,
        #[allow(missing_docs)]
        label: String,
    },
    /// A label's code doesn't fit the raw codec, so it would clamp on
    /// encode and decode back as a different label.
    #[error("enum {codec} maps label {label} to {code}, outside the codec's range")]
    EnumCodeOutOfRange {
        #[allow(missing_docs)]
        codec: String,
        #[allow(missing_docs)]
        label: String,
        #[allow(missing_docs)]
        code: u32,
    },
    /// A buffer ended before the node it was being parsed against.
    #[error("{what} at {address} needs {needed} bytes, buffer has {available}")]
    DataTooShort {
        #[allow(missing_docs)]
        what: String,
        #[allow(missing_docs)]
        address: DeviceAddress,
        #[allow(missing_docs)]
        needed: usize,
        #[allow(missing_docs)]
        available: usize,
    },
    #[allow(missing_docs)]
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A node in the address map.
#[derive(Clone, Debug)]
pub enum Atom {
    /// A leaf field wrapping a codec.
    Field(FieldDefinition),
    /// A composite of named members at ascending offsets.
    Struct(StructDefinition),
}
impl Atom {
    /// Byte offset relative to the parent node.
    pub fn offset(&self) -> u32 {
        match self {
            Atom::Field(f) => f.offset,
            Atom::Struct(s) => s.offset,
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Atom::Field(f) => f.codec.size() as u32,
            Atom::Struct(s) => s.size,
        }
    }

    /// Whether this node's bytes occupy one unbroken address range, which
    /// permits fetching it with a single request.
    pub fn is_contiguous(&self) -> bool {
        match self {
            Atom::Field(_) => true,
            Atom::Struct(s) => s.contiguous,
        }
    }

    #[allow(missing_docs)]
    pub fn description(&self) -> &str {
        match self {
            Atom::Field(f) => &f.description,
            Atom::Struct(s) => &s.description,
        }
    }

    /// Every node in this subtree paired with its absolute address, parent
    /// first, assuming this node itself lives at `base`.
    pub fn addresses(&self, base: DeviceAddress) -> Vec<AtomReference<'_>> {
        let mut out = Vec::new();
        self.collect_addresses(base, &mut out);
        out
    }

    fn collect_addresses<'a>(&'a self, base: DeviceAddress, out: &mut Vec<AtomReference<'a>>) {
        out.push(AtomReference {
            address: base,
            atom: self,
        });
        if let Atom::Struct(s) = self {
            for (_, member) in &s.members {
                member.collect_addresses(base.offset_by(member.offset()), out);
            }
        }
    }
}

/// A leaf of the address map: one codec at one offset. Always contiguous.
#[derive(Clone, Debug)]
pub struct FieldDefinition {
    /// Byte offset relative to the parent struct.
    pub offset: u32,
    #[allow(missing_docs)]
    pub description: String,
    #[allow(missing_docs)]
    pub codec: Arc<dyn Codec>,
}
impl FieldDefinition {
    #[allow(missing_docs)]
    pub fn new(offset: u32, description: &str, codec: impl Codec + 'static) -> Self {
        Self {
            offset,
            description: description.to_string(),
            codec: Arc::new(codec),
        }
    }

    /// The concrete handle [set_field](crate::transfer::TransferService::set_field)
    /// takes, given the absolute address of this field's parent.
    pub fn reference_at(&self, parent: DeviceAddress) -> FieldReference {
        FieldReference {
            address: parent.offset_by(self.offset),
            codec: Arc::clone(&self.codec),
        }
    }
}

/// An ordered composite of named members.
#[derive(Clone, Debug)]
pub struct StructDefinition {
    /// Byte offset relative to the parent struct.
    pub offset: u32,
    #[allow(missing_docs)]
    pub description: String,
    members: Vec<(String, Atom)>,
    size: u32,
    contiguous: bool,
}
impl StructDefinition {
    /// Builds a struct, validating that members are listed in non-decreasing
    /// offset order and do not overlap. A violation is a schema bug and fails
    /// construction.
    pub fn new(
        offset: u32,
        description: &str,
        members: Vec<(&str, Atom)>,
    ) -> Result<Self, SchemaError> {
        let mut end = 0u32;
        let mut contiguous = true;
        for (name, member) in &members {
            if member.offset() < end {
                return Err(SchemaError::MemberOverlap {
                    parent: description.to_string(),
                    member: name.to_string(),
                    offset: member.offset(),
                    end,
                });
            }
            if member.offset() != end || !member.is_contiguous() {
                contiguous = false;
            }
            end = member.offset() + member.size();
        }
        Ok(Self {
            offset,
            description: description.to_string(),
            members: members
                .into_iter()
                .map(|(name, member)| (name.to_string(), member))
                .collect(),
            size: end,
            contiguous,
        })
    }

    /// The members in offset order.
    pub fn members(&self) -> impl Iterator<Item = (&str, &Atom)> {
        self.members
            .iter()
            .map(|(name, member)| (name.as_str(), member))
    }

    /// Looks up a direct member by name.
    pub fn member(&self, name: &str) -> Option<&Atom> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, member)| member)
    }

    /// Looks up a direct field member by name and resolves it to a concrete
    /// reference, given this struct's absolute address.
    pub fn field_reference(&self, base: DeviceAddress, name: &str) -> Option<FieldReference> {
        match self.member(name)? {
            Atom::Field(f) => Some(f.reference_at(base)),
            Atom::Struct(_) => None,
        }
    }
}

/// A node of the tree resolved to a concrete device address.
#[derive(Clone, Copy, Debug)]
pub struct AtomReference<'a> {
    #[allow(missing_docs)]
    pub address: DeviceAddress,
    #[allow(missing_docs)]
    pub atom: &'a Atom,
}

/// An addressable leaf field: where it lives and how to encode it.
#[derive(Clone, Debug)]
pub struct FieldReference {
    #[allow(missing_docs)]
    pub address: DeviceAddress,
    #[allow(missing_docs)]
    pub codec: Arc<dyn Codec>,
}
