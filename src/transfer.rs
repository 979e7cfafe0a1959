// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The data-transfer service: bridges the address map and the wire protocol
//! to a live transport through the scheduler, correlating outgoing requests
//! with the asynchronous replies that eventually answer them.

use crate::scheduler::Scheduler;
use crate::schema::{
    fetch_and_parse, fetch_and_tokenize, Atom, FetchBytes, FetchHandle, FieldReference,
    ParsedDataBag, RawDataBag, SchemaError, Value,
};
use crate::sysex::{
    data_request_frame, data_set_frame, identity_request_frame, parse_data_set,
    parse_identity_reply, DeviceModel,
};
use crate::types::{DeviceAddress, DeviceContext, DeviceIdentity};
use crate::util::{ChannelPair, ProvidesService};
use crossbeam_channel::{Receiver, Sender};
use derivative::Derivative;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// The queue writes drain from: ahead of everything else, so a pending edit
/// always reaches the device before a newly queued read.
pub const QUEUE_WRITE_UTMOST: &str = "write_utmost";
/// The queue for reads that must beat even registered-priority queues.
pub const QUEUE_READ_UTMOST: &str = "read_utmost";
/// Where reads land when the caller doesn't care: drained last.
pub const QUEUE_READ_DEFAULT: &str = "read_default";

/// How long a fetch waits for its matching reply before giving up.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Settle time the device needs after each frame before the next one.
const SEND_GAP: Duration = Duration::from_millis(20);

/// Per-request runtime failures. These are expected conditions: they reject
/// the one request they belong to and never stop the scheduler or disturb
/// unrelated in-flight operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No matching reply arrived within the timeout window.
    #[error("no matching reply for {len} bytes at {address}")]
    Timeout {
        #[allow(missing_docs)]
        address: DeviceAddress,
        #[allow(missing_docs)]
        len: usize,
    },
    /// The request's cancellation token fired, or its device context went
    /// stale before the reply arrived.
    #[error("request was cancelled")]
    Cancelled,
    /// The transport failed to accept the outgoing frame.
    #[error(transparent)]
    Send(#[from] anyhow::Error),
    /// The reply arrived but didn't decode against the schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Lets a caller abandon a multi-chunk read between chunks. A frame already
/// on the wire cannot be revoked; its reply, if any, is discarded.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);
impl CancellationToken {
    #[allow(missing_docs)]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[allow(missing_docs)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The one thing the core asks of the host's MIDI layer: put these bytes on
/// the wire. Inbound frames come back through
/// [TransferServiceInput::Frame].
pub trait Transport: core::fmt::Debug + Send + Sync {
    #[allow(missing_docs)]
    fn send(&self, frame: &[u8]) -> anyhow::Result<()>;
}

/// The host sends [TransferServiceInput] messages to control the service.
#[derive(Debug)]
pub enum TransferServiceInput {
    /// A raw inbound MIDI frame from the transport.
    Frame(Vec<u8>),
    /// The live device configuration changed. Pending fetches issued under
    /// the old configuration are rejected as cancelled.
    SetContext(DeviceContext),
    /// Shut the service down.
    Quit,
}

/// [TransferServiceEvent] messages tell the host what happened.
#[derive(Debug)]
pub enum TransferServiceEvent {
    /// A device answered the identity broadcast.
    Identity(DeviceIdentity),
}

/// Options for [TransferService::request_data_with].
#[derive(Debug, Derivative)]
#[derivative(Default)]
pub struct RequestOptions {
    /// Which scheduler queue the read's chunks land on.
    #[derivative(Default(value = "QUEUE_READ_DEFAULT.to_string()"))]
    pub queue_id: String,
    #[allow(missing_docs)]
    pub cancel: Option<CancellationToken>,
}

// An in-flight read awaiting its reply, matched by exact address and length
// plus device-context equality. The token distinguishes otherwise-identical
// entries.
#[derive(Debug)]
struct PendingFetch {
    token: u64,
    address: DeviceAddress,
    len: usize,
    context: DeviceContext,
    sender: Sender<Result<Vec<u8>, TransferError>>,
}

static NEXT_FETCH_TOKEN: AtomicU64 = AtomicU64::new(0);

/// [TransferService] owns all traffic to and from one device.
///
/// Every outgoing frame passes through the scheduler, so only one frame is
/// ever in flight and the inter-message gap is honored after each send. The
/// pending-fetch set is touched only from the frame-handling thread and the
/// scheduler's drain thread, each behind the mutex, so there is no wider
/// locking protocol to get wrong.
#[derive(Debug)]
pub struct TransferService {
    inputs: ChannelPair<TransferServiceInput>,
    events: ChannelPair<TransferServiceEvent>,

    transport: Arc<dyn Transport>,
    model: &'static DeviceModel,
    scheduler: Scheduler,

    context: Arc<Mutex<DeviceContext>>,
    pending: Arc<Mutex<Vec<PendingFetch>>>,
    priority_registrations: Mutex<Vec<(String, usize)>>,

    response_timeout: Duration,
    send_gap: Duration,
}
impl ProvidesService<TransferServiceInput, TransferServiceEvent> for TransferService {
    fn sender(&self) -> &Sender<TransferServiceInput> {
        &self.inputs.sender
    }

    fn receiver(&self) -> &Receiver<TransferServiceEvent> {
        &self.events.receiver
    }
}
impl TransferService {
    /// Creates a new [TransferService] speaking `model`'s dialect over
    /// `transport`.
    pub fn new_with(transport: &Arc<dyn Transport>, model: &'static DeviceModel) -> Self {
        let r = Self {
            inputs: Default::default(),
            events: Default::default(),
            transport: Arc::clone(transport),
            model,
            scheduler: Scheduler::default(),
            context: Default::default(),
            pending: Default::default(),
            priority_registrations: Default::default(),
            response_timeout: RESPONSE_TIMEOUT,
            send_gap: SEND_GAP,
        };
        r.rebuild_priority_order();
        r.spawn_frame_thread();
        r
    }

    // Sits in a loop handling whatever the host forwards: inbound frames,
    // context changes, quit.
    fn spawn_frame_thread(&self) {
        let receiver = self.inputs.receiver.clone();
        let events = self.events.sender.clone();
        let pending = Arc::clone(&self.pending);
        let context = Arc::clone(&self.context);
        let model = self.model;
        std::thread::spawn(move || {
            while let Ok(input) = receiver.recv() {
                match input {
                    TransferServiceInput::Frame(frame) => {
                        Self::handle_frame(model, &pending, &context, &events, &frame);
                    }
                    TransferServiceInput::SetContext(new_context) => {
                        if let Ok(mut live) = context.lock() {
                            *live = new_context.clone();
                        }
                        Self::reject_stale(&pending, &new_context);
                    }
                    TransferServiceInput::Quit => return,
                }
            }
            eprintln!("TransferService input channel failed; exiting");
        });
    }

    fn handle_frame(
        model: &DeviceModel,
        pending: &Mutex<Vec<PendingFetch>>,
        context: &Mutex<DeviceContext>,
        events: &Sender<TransferServiceEvent>,
        frame: &[u8],
    ) {
        if let Some(identity) = parse_identity_reply(frame) {
            let _ = events.send(TransferServiceEvent::Identity(identity));
            return;
        }
        let Some(data_set) = parse_data_set(model, frame) else {
            // Foreign frame; not ours to complain about.
            return;
        };
        if !data_set.has_valid_checksum(model) {
            return;
        }
        let live = match context.lock() {
            Ok(c) => c.clone(),
            Err(_) => return,
        };
        if let Ok(mut pending) = pending.lock() {
            if let Some(index) = pending.iter().position(|p| {
                p.address == data_set.address
                    && p.len == data_set.value.len()
                    && p.context == live
            }) {
                let fetch = pending.remove(index);
                let _ = fetch.sender.send(Ok(data_set.value));
            }
            // No match: a reply to an abandoned or foreign request.
        }
    }

    // Rejects every pending fetch whose context no longer matches the live
    // one, rather than leaving them to time out.
    fn reject_stale(pending: &Mutex<Vec<PendingFetch>>, live: &DeviceContext) {
        if let Ok(mut pending) = pending.lock() {
            let stale: Vec<PendingFetch> = {
                let (stale, fresh) = pending.drain(..).partition(|p| &p.context != live);
                *pending = fresh;
                stale
            };
            for fetch in stale {
                let _ = fetch.sender.send(Err(TransferError::Cancelled));
            }
        }
    }

    fn remove_pending(pending: &Mutex<Vec<PendingFetch>>, token: u64) {
        if let Ok(mut pending) = pending.lock() {
            pending.retain(|p| p.token != token);
        }
    }

    /// Reads the subtree under `atom` at `base` from the device, returning
    /// raw bytes per address. One logical request may become several
    /// scheduler tasks (one per coalesced contiguous block), executed in
    /// sequence but awaited together here.
    pub fn request_data(
        &self,
        atom: &Atom,
        base: DeviceAddress,
    ) -> Result<RawDataBag, TransferError> {
        self.request_data_with(atom, base, &RequestOptions::default())
    }

    #[allow(missing_docs)]
    pub fn request_data_with(
        &self,
        atom: &Atom,
        base: DeviceAddress,
        options: &RequestOptions,
    ) -> Result<RawDataBag, TransferError> {
        let fetcher = ChunkFetcher {
            service: self,
            queue_id: options.queue_id.clone(),
            cancel: options.cancel.clone(),
        };
        fetch_and_tokenize(&fetcher, atom, base)
    }

    /// Like [TransferService::request_data], but decodes the reply.
    pub fn request_parsed(
        &self,
        atom: &Atom,
        base: DeviceAddress,
    ) -> Result<ParsedDataBag, TransferError> {
        self.request_parsed_with(atom, base, &RequestOptions::default())
    }

    #[allow(missing_docs)]
    pub fn request_parsed_with(
        &self,
        atom: &Atom,
        base: DeviceAddress,
        options: &RequestOptions,
    ) -> Result<ParsedDataBag, TransferError> {
        let fetcher = ChunkFetcher {
            service: self,
            queue_id: options.queue_id.clone(),
            cancel: options.cancel.clone(),
        };
        fetch_and_parse(&fetcher, atom, base)
    }

    /// Writes one field, fire and forget. The write drains ahead of any
    /// queued read.
    pub fn set_field(&self, field: &FieldReference, value: &Value) {
        let mut bytes = vec![0u8; field.codec.size()];
        if let Err(e) = field.codec.encode(value, &mut bytes) {
            eprintln!("set_field at {}: {e}", field.address);
            return;
        }
        let transport = Arc::clone(&self.transport);
        let model = self.model;
        let context = Arc::clone(&self.context);
        let address = field.address;
        let gap = self.send_gap;
        let _ = self.scheduler.enqueue(QUEUE_WRITE_UTMOST, move || {
            let device_id = context.lock().map(|c| c.device_id).unwrap_or_default();
            let frame = data_set_frame(model, device_id, address, &bytes);
            if let Err(e) = transport.send(&frame) {
                eprintln!("While writing {address}: {e:?}");
            }
            std::thread::sleep(gap);
        });
    }

    /// Broadcasts the identity request. Any answer arrives later as a
    /// [TransferServiceEvent::Identity].
    pub fn request_identity(&self) {
        let transport = Arc::clone(&self.transport);
        let gap = self.send_gap;
        let _ = self.scheduler.enqueue(QUEUE_READ_UTMOST, move || {
            if let Err(e) = transport.send(&identity_request_frame()) {
                eprintln!("While broadcasting identity request: {e:?}");
            }
            std::thread::sleep(gap);
        });
    }

    /// Marks a named queue as caring right now (e.g. the parameters the
    /// current screen shows). Registrations are reference-counted and merge
    /// into the drain order ahead of default reads but behind the utmost
    /// write/read queues.
    pub fn register_queue_as_priority(&self, queue_id: &str) {
        if let Ok(mut registrations) = self.priority_registrations.lock() {
            if let Some(entry) = registrations.iter_mut().find(|(id, _)| id == queue_id) {
                entry.1 += 1;
            } else {
                registrations.push((queue_id.to_string(), 1));
            }
        }
        self.rebuild_priority_order();
    }

    /// Undoes one [TransferService::register_queue_as_priority].
    pub fn unregister_queue_as_priority(&self, queue_id: &str) {
        if let Ok(mut registrations) = self.priority_registrations.lock() {
            if let Some(index) = registrations.iter().position(|(id, _)| id == queue_id) {
                registrations[index].1 -= 1;
                if registrations[index].1 == 0 {
                    registrations.remove(index);
                }
            }
        }
        self.rebuild_priority_order();
    }

    fn rebuild_priority_order(&self) {
        let mut order = vec![QUEUE_WRITE_UTMOST.to_string(), QUEUE_READ_UTMOST.to_string()];
        if let Ok(registrations) = self.priority_registrations.lock() {
            for (id, _) in registrations.iter() {
                if !order.iter().any(|o| o == id) && id != QUEUE_READ_DEFAULT {
                    order.push(id.clone());
                }
            }
        }
        order.push(QUEUE_READ_DEFAULT.to_string());
        self.scheduler.set_priority_order(order);
    }

    /// Cleans up the service for quitting.
    pub fn exit(&self) {
        self.send_input(TransferServiceInput::Quit);
    }
}

// Adapts the service to the schema layer's fetch interface: each chunk
// becomes one scheduler task that registers a pending fetch, sends an RQ1,
// and blocks the drain thread until the reply or the timeout.
struct ChunkFetcher<'a> {
    service: &'a TransferService,
    queue_id: String,
    cancel: Option<CancellationToken>,
}
impl FetchBytes for ChunkFetcher<'_> {
    fn fetch(&self, address: DeviceAddress, len: usize) -> FetchHandle {
        let (handle, sender) = FetchHandle::pair();
        let transport = Arc::clone(&self.service.transport);
        let model = self.service.model;
        let pending = Arc::clone(&self.service.pending);
        let context = Arc::clone(&self.service.context);
        let cancel = self.cancel.clone();
        let timeout = self.service.response_timeout;
        let gap = self.service.send_gap;
        let _ = self.service.scheduler.enqueue(&self.queue_id, move || {
            let _ = sender.send(run_fetch(
                &*transport,
                model,
                &pending,
                &context,
                cancel.as_ref(),
                timeout,
                gap,
                address,
                len,
            ));
        });
        handle
    }
}

#[allow(clippy::too_many_arguments)]
fn run_fetch(
    transport: &dyn Transport,
    model: &DeviceModel,
    pending: &Mutex<Vec<PendingFetch>>,
    context: &Mutex<DeviceContext>,
    cancel: Option<&CancellationToken>,
    timeout: Duration,
    gap: Duration,
    address: DeviceAddress,
    len: usize,
) -> Result<Vec<u8>, TransferError> {
    if cancel.is_some_and(|c| c.is_cancelled()) {
        return Err(TransferError::Cancelled);
    }
    let live = match context.lock() {
        Ok(c) => c.clone(),
        Err(_) => return Err(TransferError::Cancelled),
    };
    let token = NEXT_FETCH_TOKEN.fetch_add(1, Ordering::Relaxed);
    let (reply_sender, reply_receiver) = crossbeam_channel::bounded(1);
    {
        let Ok(mut pending) = pending.lock() else {
            return Err(TransferError::Cancelled);
        };
        // Registered before the frame leaves, so even an instant reply
        // finds its fetch.
        pending.push(PendingFetch {
            token,
            address,
            len,
            context: live.clone(),
            sender: reply_sender,
        });
    }
    if let Err(e) = transport.send(&data_request_frame(model, live.device_id, address, len as u32))
    {
        TransferService::remove_pending(pending, token);
        return Err(TransferError::Send(e));
    }
    let result = match reply_receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            TransferService::remove_pending(pending, token);
            Err(TransferError::Timeout { address, len })
        }
    };
    std::thread::sleep(gap);
    result
}
