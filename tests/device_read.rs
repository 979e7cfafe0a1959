// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! End-to-end exercise of the transfer service against a simulated GR-55.

use gr55_core::prelude::*;
use gr55_core::sysex::{data_set_frame, parse_data_request, parse_data_set};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// A fake GR-55: patch common memory behind a loopback transport. RQ1 frames
// are answered with DT1 replies built from the memory image; DT1 frames are
// applied to it. Replies re-enter the service through its own input channel,
// exactly as a host's MIDI callback would deliver them.
#[derive(Debug)]
struct FakeGr55 {
    memory: Mutex<Vec<u8>>,
    reply_to: Mutex<Option<crossbeam_channel::Sender<TransferServiceInput>>>,
    requests_seen: Mutex<usize>,
}
impl FakeGr55 {
    fn new_with(memory: Vec<u8>) -> Self {
        Self {
            memory: Mutex::new(memory),
            reply_to: Mutex::new(None),
            requests_seen: Mutex::new(0),
        }
    }

    fn connect(&self, service: &TransferService) {
        *self.reply_to.lock().unwrap() = Some(service.sender().clone());
    }

    fn offset_of(&self, address: DeviceAddress) -> usize {
        (u32::from(address) - u32::from(*PATCH_COMMON_BASE)) as usize
    }
}
impl Transport for FakeGr55 {
    fn send(&self, frame: &[u8]) -> anyhow::Result<()> {
        if let Some(request) = parse_data_request(&GR55, frame) {
            *self.requests_seen.lock().unwrap() += 1;
            let start = self.offset_of(request.address);
            // For RQ1 the value region carries the big-endian 7-bit length.
            let len = request
                .value
                .iter()
                .fold(0usize, |acc, &b| (acc << 7) | usize::from(b));
            let chunk = self.memory.lock().unwrap()[start..start + len].to_vec();
            let reply = data_set_frame(&GR55, request.device_id, request.address, &chunk);
            if let Some(sender) = self.reply_to.lock().unwrap().as_ref() {
                sender.send(TransferServiceInput::Frame(reply))?;
            }
        } else if let Some(write) = parse_data_set(&GR55, frame) {
            let start = self.offset_of(write.address);
            self.memory.lock().unwrap()[start..start + write.value.len()]
                .copy_from_slice(&write.value);
        }
        Ok(())
    }
}

fn patch_common_image(name: &str) -> Vec<u8> {
    let mut memory = vec![0u8; 0x30];
    let padded = format!("{name:<16}");
    memory[..16].copy_from_slice(padded.as_bytes());
    memory
}

fn name_at(bag: &gr55_core::schema::ParsedDataBag, address: DeviceAddress) -> String {
    match bag.get(&address) {
        Some(Value::Text(text)) => text.clone(),
        other => panic!("expected a text value at {address}, got {other:?}"),
    }
}

#[test]
fn read_reload_and_write_against_a_simulated_device() {
    let fake = Arc::new(FakeGr55::new_with(patch_common_image("remote1")));
    let transport: Arc<dyn Transport> = fake.clone();
    let service = TransferService::new_with(&transport, &GR55);
    fake.connect(&service);

    // First read sees the device's current state.
    let first = service
        .request_parsed(&PATCH_COMMON, *PATCH_COMMON_BASE)
        .expect("first read");
    assert_eq!(name_at(&first, *PATCH_COMMON_BASE), "remote1");

    // The whole block coalesces into one request per contiguous run: the
    // fields through effect_level, then the PCM tone block past the gap.
    assert_eq!(*fake.requests_seen.lock().unwrap(), 2);

    // The patch changes on the device itself; a reload notices, and the
    // already-returned bag keeps the state it was read under.
    fake.memory.lock().unwrap()[..16].copy_from_slice(b"remote2         ");
    let second = service
        .request_parsed(&PATCH_COMMON, *PATCH_COMMON_BASE)
        .expect("second read");
    assert_eq!(name_at(&second, *PATCH_COMMON_BASE), "remote2");
    assert_eq!(name_at(&first, *PATCH_COMMON_BASE), "remote1");

    // A field write goes out as DT1 and lands in device memory.
    let Atom::Struct(common) = &*PATCH_COMMON else {
        panic!("patch common must be a struct");
    };
    let level = common
        .field_reference(*PATCH_COMMON_BASE, "level")
        .expect("level field");
    service.set_field(&level, &Value::Int(99));
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if fake.memory.lock().unwrap()[0x10] == 99 {
            break;
        }
        assert!(Instant::now() < deadline, "write never reached the device");
        std::thread::sleep(Duration::from_millis(5));
    }

    let third = service
        .request_parsed(&PATCH_COMMON, *PATCH_COMMON_BASE)
        .expect("third read");
    assert_eq!(
        third.get(&PATCH_COMMON_BASE.offset_by(0x10)),
        Some(&Value::Int(99))
    );
    service.exit();
}

#[test]
fn raw_reads_return_one_slice_per_contiguous_node() {
    let fake = Arc::new(FakeGr55::new_with(patch_common_image("slices")));
    let transport: Arc<dyn Transport> = fake.clone();
    let service = TransferService::new_with(&transport, &GR55);
    fake.connect(&service);

    let bag = service
        .request_data(&PATCH_COMMON, *PATCH_COMMON_BASE)
        .expect("raw read");
    assert_eq!(
        bag.get(&*PATCH_COMMON_BASE).map(Vec::len),
        Some(16),
        "the name field's slice covers its 16 bytes"
    );
    // At the shared pcm1/tone_number address the innermost node wins.
    assert_eq!(bag.get(&PATCH_COMMON_BASE.offset_by(0x20)).map(Vec::len), Some(3));
    assert_eq!(bag.get(&PATCH_COMMON_BASE.offset_by(0x10)).map(Vec::len), Some(1));
    service.exit();
}
