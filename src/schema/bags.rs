// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Turning buffers into address-keyed bags of raw slices or parsed values,
//! and fetching the bytes for a whole subtree in as few device round trips
//! as the tree's shape allows.

use super::atoms::{Atom, SchemaError};
use super::fields::Value;
use crate::transfer::TransferError;
use crate::types::DeviceAddress;
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;

/// Raw bytes per absolute address, one entry for every contiguous node of
/// the definition the bag was built against.
pub type RawDataBag = BTreeMap<DeviceAddress, Vec<u8>>;

/// Decoded values per absolute address. Structs contribute their empty value
/// before their children, so at a shared (zero-offset) address the innermost
/// node wins.
pub type ParsedDataBag = BTreeMap<DeviceAddress, Value>;

/// Decodes `buffer` against `atom`, assuming the buffer's first byte lives
/// at `base`.
pub fn parse(buffer: &[u8], atom: &Atom, base: DeviceAddress) -> Result<ParsedDataBag, SchemaError> {
    let mut bag = ParsedDataBag::new();
    parse_into(&mut bag, buffer, atom, base, base)?;
    Ok(bag)
}

fn parse_into(
    bag: &mut ParsedDataBag,
    buffer: &[u8],
    atom: &Atom,
    base: DeviceAddress,
    at: DeviceAddress,
) -> Result<(), SchemaError> {
    match atom {
        Atom::Struct(s) => {
            bag.insert(at, Value::Empty);
            for (_, member) in s.members() {
                parse_into(bag, buffer, member, base, at.offset_by(member.offset()))?;
            }
            Ok(())
        }
        Atom::Field(f) => {
            let slice = range_of(buffer, base, at, f.codec.size(), &f.description)?;
            bag.insert(at, f.codec.decode(slice)?);
            Ok(())
        }
    }
}

/// Same walk as [parse], but copies raw byte ranges instead of decoding.
/// Every contiguous node, not just leaves, gets a slice, so callers can
/// hold the un-decoded bytes of an entire contiguous run.
pub fn tokenize(buffer: &[u8], atom: &Atom, base: DeviceAddress) -> Result<RawDataBag, SchemaError> {
    let mut bag = RawDataBag::new();
    tokenize_into(&mut bag, buffer, atom, base, base)?;
    Ok(bag)
}

fn tokenize_into(
    bag: &mut RawDataBag,
    buffer: &[u8],
    atom: &Atom,
    base: DeviceAddress,
    at: DeviceAddress,
) -> Result<(), SchemaError> {
    if atom.is_contiguous() {
        let slice = range_of(buffer, base, at, atom.size() as usize, atom.description())?;
        bag.insert(at, slice.to_vec());
    }
    if let Atom::Struct(s) = atom {
        for (_, member) in s.members() {
            tokenize_into(bag, buffer, member, base, at.offset_by(member.offset()))?;
        }
    }
    Ok(())
}

fn range_of<'a>(
    buffer: &'a [u8],
    base: DeviceAddress,
    at: DeviceAddress,
    size: usize,
    what: &str,
) -> Result<&'a [u8], SchemaError> {
    let start = (at.0 - base.0) as usize;
    if buffer.len() < start + size {
        return Err(SchemaError::DataTooShort {
            what: what.to_string(),
            address: at,
            needed: start + size,
            available: buffer.len(),
        });
    }
    Ok(&buffer[start..start + size])
}

/// Begins one fetch of device memory. [FetchBytes::fetch] returns
/// immediately; the bytes arrive later through [FetchHandle::wait]. This
/// split lets a caller issue every fetch for a subtree before awaiting any
/// of them.
pub trait FetchBytes {
    #[allow(missing_docs)]
    fn fetch(&self, address: DeviceAddress, len: usize) -> FetchHandle;
}

/// The awaitable half of a fetch.
#[derive(Debug)]
pub struct FetchHandle {
    receiver: Receiver<Result<Vec<u8>, TransferError>>,
}
impl FetchHandle {
    /// Creates a handle and the sender that will complete it.
    pub fn pair() -> (Self, Sender<Result<Vec<u8>, TransferError>>) {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        (Self { receiver }, sender)
    }

    /// A handle that is already complete. Handy for tests and caches.
    pub fn ready(result: Result<Vec<u8>, TransferError>) -> Self {
        let (handle, sender) = Self::pair();
        let _ = sender.send(result);
        handle
    }

    /// Blocks until the fetch completes. A dropped sender counts as
    /// cancellation.
    pub fn wait(self) -> Result<Vec<u8>, TransferError> {
        self.receiver
            .recv()
            .unwrap_or(Err(TransferError::Cancelled))
    }
}

// One planned fetch covering a run of members, remembering which nodes to
// carve back out of the returned block.
struct PlannedFetch<'a> {
    start: DeviceAddress,
    handle: FetchHandle,
    nodes: Vec<(DeviceAddress, &'a Atom)>,
}

/// Fetches and decodes a whole subtree. See [fetch_and_tokenize] for the
/// round-trip strategy; this variant decodes each fetched block and also
/// records the empty entry for every struct it visits, mirroring [parse].
pub fn fetch_and_parse(
    fetcher: &dyn FetchBytes,
    atom: &Atom,
    base: DeviceAddress,
) -> Result<ParsedDataBag, TransferError> {
    let mut bag = ParsedDataBag::new();
    for r in atom.addresses(base) {
        if let Atom::Struct(_) = r.atom {
            bag.insert(r.address, Value::Empty);
        }
    }
    for planned in plan_fetches(fetcher, atom, base) {
        let bytes = planned.handle.wait()?;
        for (at, node) in planned.nodes {
            let slice = range_of(&bytes, planned.start, at, node.size() as usize, node.description())
                .map_err(SchemaError::from)?;
            let sub = parse(slice, node, at).map_err(TransferError::from)?;
            bag.extend(sub);
        }
    }
    Ok(bag)
}

/// Fetches the raw bytes for a whole subtree, minimizing device round trips:
/// consecutive contiguous members coalesce into one fetch, the accumulated
/// block flushes at each non-contiguous member (which is then planned
/// independently), and every fetch is issued before any is awaited.
pub fn fetch_and_tokenize(
    fetcher: &dyn FetchBytes,
    atom: &Atom,
    base: DeviceAddress,
) -> Result<RawDataBag, TransferError> {
    let mut bag = RawDataBag::new();
    for planned in plan_fetches(fetcher, atom, base) {
        let bytes = planned.handle.wait()?;
        for (at, node) in planned.nodes {
            let slice = range_of(&bytes, planned.start, at, node.size() as usize, node.description())
                .map_err(SchemaError::from)?;
            let sub = tokenize(slice, node, at).map_err(TransferError::from)?;
            bag.extend(sub);
        }
    }
    Ok(bag)
}

// Walks the tree issuing fetches as it goes. Contiguous members accumulate
// into the current run; a non-contiguous struct member recurses on its own.
fn plan_fetches<'a>(
    fetcher: &dyn FetchBytes,
    atom: &'a Atom,
    base: DeviceAddress,
) -> Vec<PlannedFetch<'a>> {
    let mut planned = Vec::new();
    plan_into(fetcher, atom, base, &mut planned);
    planned
}

fn plan_into<'a>(
    fetcher: &dyn FetchBytes,
    atom: &'a Atom,
    base: DeviceAddress,
    planned: &mut Vec<PlannedFetch<'a>>,
) {
    if atom.is_contiguous() {
        flush_run(fetcher, base, vec![(base, atom)], planned);
        return;
    }
    let Atom::Struct(s) = atom else {
        return; // fields are always contiguous
    };
    let mut run: Vec<(DeviceAddress, &'a Atom)> = Vec::new();
    let mut run_start = base;
    let mut run_end = base;
    for (_, member) in s.members() {
        let at = base.offset_by(member.offset());
        if member.is_contiguous() {
            // A gap breaks the run even when the member itself is
            // contiguous; the device won't answer one request for two
            // disjoint ranges.
            if !run.is_empty() && at != run_end {
                flush_run(fetcher, run_start, std::mem::take(&mut run), planned);
            }
            if run.is_empty() {
                run_start = at;
            }
            run.push((at, member));
            run_end = at.offset_by(member.size());
        } else {
            if !run.is_empty() {
                flush_run(fetcher, run_start, std::mem::take(&mut run), planned);
            }
            plan_into(fetcher, member, at, planned);
        }
    }
    if !run.is_empty() {
        flush_run(fetcher, run_start, run, planned);
    }
}

fn flush_run<'a>(
    fetcher: &dyn FetchBytes,
    start: DeviceAddress,
    nodes: Vec<(DeviceAddress, &'a Atom)>,
    planned: &mut Vec<PlannedFetch<'a>>,
) {
    let end = nodes
        .iter()
        .map(|(at, node)| at.0 + node.size())
        .max()
        .unwrap_or(start.0);
    let handle = fetcher.fetch(start, (end - start.0) as usize);
    planned.push(PlannedFetch {
        start,
        handle,
        nodes,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::atoms::{FieldDefinition, StructDefinition};
    use crate::schema::fields::{AsciiField, BoolField, UByteField, UWordField};
    use std::sync::Mutex;

    fn field(offset: u32, name: &str, codec: impl crate::schema::fields::Codec + 'static) -> (&str, Atom) {
        (name, Atom::Field(FieldDefinition::new(offset, name, codec)))
    }

    fn patch_like() -> Atom {
        // Four contiguous fields, then a non-contiguous sub-struct.
        let effects = StructDefinition::new(
            0x100,
            "effects",
            vec![
                field(0, "switch", BoolField),
                field(1, "depth", UByteField::default()),
            ],
        )
        .unwrap();
        Atom::Struct(
            StructDefinition::new(
                0,
                "patch",
                vec![
                    field(0, "name", AsciiField::new(8)),
                    field(8, "level", UByteField::default()),
                    field(9, "sensitivity", UByteField::default()),
                    field(10, "cutoff", UWordField::default()),
                    ("effects", Atom::Struct(effects)),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn parse_records_structs_then_leaves() {
        let atom = patch_like();
        let Atom::Struct(ref s) = atom else {
            panic!()
        };
        let head = s.member("name").unwrap();

        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"remote1 ");
        let bag = parse(&buffer, head, DeviceAddress::new(0x20)).unwrap();
        assert_eq!(
            bag.get(&DeviceAddress::new(0x20)),
            Some(&Value::Text("remote1".to_string()))
        );
    }

    #[test]
    fn parse_struct_registers_every_node() {
        let inner = StructDefinition::new(
            0,
            "inner",
            vec![field(0, "flag", BoolField)],
        )
        .unwrap();
        let outer = Atom::Struct(
            StructDefinition::new(0, "outer", vec![("inner", Atom::Struct(inner))]).unwrap(),
        );
        let bag = parse(&[0x01], &outer, DeviceAddress::new(0)).unwrap();
        // outer, inner, and flag all live at address 0; the innermost wins.
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get(&DeviceAddress::new(0)), Some(&Value::Bool(true)));
    }

    #[test]
    fn parse_too_short_names_the_offender() {
        let atom = patch_like();
        let err = parse(&[0u8; 9], &atom, DeviceAddress::new(0)).unwrap_err();
        match err {
            SchemaError::DataTooShort { what, address, .. } => {
                assert_eq!(what, "sensitivity");
                assert_eq!(address, DeviceAddress::new(9));
            }
            other => panic!("expected DataTooShort, got {other:?}"),
        }
    }

    #[test]
    fn tokenize_materializes_contiguous_runs() {
        let contiguous = StructDefinition::new(
            0,
            "pair",
            vec![
                field(0, "a", UByteField::default()),
                field(1, "b", UByteField::default()),
            ],
        )
        .unwrap();
        let atom = Atom::Struct(contiguous);
        let bag = tokenize(&[0x11, 0x22], &atom, DeviceAddress::new(0x40)).unwrap();
        // The struct's own slice covers both members; member "a" overwrote
        // the struct entry at the shared base address.
        assert_eq!(bag.get(&DeviceAddress::new(0x40)), Some(&vec![0x11]));
        assert_eq!(bag.get(&DeviceAddress::new(0x41)), Some(&vec![0x22]));
    }

    #[test]
    fn tokenize_keeps_whole_struct_slice_at_distinct_address() {
        let contiguous = StructDefinition::new(
            0,
            "pair",
            vec![
                field(1, "a", UByteField::default()),
            ],
        )
        .unwrap();
        // Not contiguous (gap before "a"), so no struct-level slice; only
        // the leaf is materialized.
        let atom = Atom::Struct(contiguous);
        let bag = tokenize(&[0x00, 0x33], &atom, DeviceAddress::new(0)).unwrap();
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get(&DeviceAddress::new(1)), Some(&vec![0x33]));
    }

    #[derive(Default)]
    struct MockFetcher {
        memory: Vec<u8>,
        calls: Mutex<Vec<(DeviceAddress, usize)>>,
    }
    impl FetchBytes for MockFetcher {
        fn fetch(&self, address: DeviceAddress, len: usize) -> FetchHandle {
            self.calls.lock().unwrap().push((address, len));
            let start = address.0 as usize;
            FetchHandle::ready(Ok(self.memory[start..start + len].to_vec()))
        }
    }

    #[test]
    fn fetch_coalesces_contiguous_members() {
        let atom = patch_like();
        let mut memory = vec![0u8; 0x102];
        memory[..8].copy_from_slice(b"remote1 ");
        memory[8] = 100;
        memory[9] = 50;
        memory[10] = 0x01;
        memory[11] = 0x20;
        memory[0x100] = 0x01;
        memory[0x101] = 42;
        let fetcher = MockFetcher {
            memory,
            calls: Default::default(),
        };

        let bag = fetch_and_parse(&fetcher, &atom, DeviceAddress::new(0)).unwrap();

        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (DeviceAddress::new(0), 12),
                (DeviceAddress::new(0x100), 2),
            ],
            "four contiguous leaves coalesce into one fetch; the detached \
             sub-struct fetches independently"
        );

        assert_eq!(
            bag.get(&DeviceAddress::new(0)),
            Some(&Value::Text("remote1".to_string()))
        );
        assert_eq!(bag.get(&DeviceAddress::new(8)), Some(&Value::Int(100)));
        assert_eq!(
            bag.get(&DeviceAddress::new(10)),
            Some(&Value::Int((0x01 << 7) | 0x20))
        );
        assert_eq!(
            bag.get(&DeviceAddress::new(0x100)),
            Some(&Value::Bool(true))
        );
        assert_eq!(bag.get(&DeviceAddress::new(0x101)), Some(&Value::Int(42)));
    }

    #[test]
    fn fetch_and_tokenize_returns_raw_slices() {
        let atom = patch_like();
        let mut memory = vec![0u8; 0x102];
        memory[..8].copy_from_slice(b"12345678");
        let fetcher = MockFetcher {
            memory,
            calls: Default::default(),
        };
        let bag = fetch_and_tokenize(&fetcher, &atom, DeviceAddress::new(0)).unwrap();
        assert_eq!(
            bag.get(&DeviceAddress::new(0)),
            Some(&b"12345678".to_vec())
        );
    }

    #[test]
    fn fetch_failure_propagates() {
        struct FailingFetcher;
        impl FetchBytes for FailingFetcher {
            fn fetch(&self, address: DeviceAddress, len: usize) -> FetchHandle {
                FetchHandle::ready(Err(TransferError::Timeout { address, len }))
            }
        }
        let atom = patch_like();
        let err = fetch_and_parse(&FailingFetcher, &atom, DeviceAddress::new(0)).unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
    }
}
