//! # Transaction Engine
//!
//! Turns one logical bus operation into one transport submission and routes
//! the terminal event back to the caller's completion callback.
//!
//! ```text
//!  submit(addr, cmd) ──► slot[addr] ──► Transport::submit(handle, frame)
//!                          │                         │
//!                          │        IRQ: complete(handle, outcome)
//!                          │                         │
//!                          │                         ▼
//!                          │                  mailbox (lock-free)
//!                          ▼                         │
//!                 on_complete(result) ◄── poll ◄─────┘
//!                          ▲
//!  tick: expire(now) ──────┘ (deadline passed: TransportTimeout)
//! ```
//!
//! Each address owns exactly one slot. A slot holds at most one outstanding
//! transaction; a second submission fails with [`MapleError::AddressBusy`]
//! instead of queueing.
//!
//! ## Interrupt Context
//!
//! [`Engine::complete`] is the only entry point the transport's interrupt
//! handler may call. It takes none of the engine's locks: the outcome is
//! pushed onto a mailbox and nothing else happens. [`Engine::poll`] drains the mailbox and runs the
//! callbacks; it runs at the start of every tick and may also be called from
//! a deferred-work context, never from an interrupt handler. Callbacks always
//! run with the slot unlocked, so a callback may submit the next step of a
//! multi-frame exchange.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use maple_proto::{Address, Command, Frame, Response, PORT_COUNT, SLOT_COUNT};
use spin::Mutex;

use crate::transport::{Outcome, TransferHandle, Transport, TransportFault};
use crate::MapleError;

/// Result handed to a completion callback
pub type Completion = Result<Frame, MapleError>;

/// Completion callback, run exactly once per accepted submission
pub type OnComplete = Box<dyn FnOnce(Completion) + Send>;

/// What the engine last learned about a unit from a finished transaction.
///
/// Timeouts leave no evidence: a slow unit is not an absent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    /// The unit answered (successfully or with an error code)
    Responded,
    /// The unit answered but does not provide the function it was asked for
    Mismatch,
    /// NONE response: nothing is plugged in at the address
    Silent,
}

const EVIDENCE_NONE: u8 = 0;
const EVIDENCE_RESPONDED: u8 = 1;
const EVIDENCE_SILENT: u8 = 2;
const EVIDENCE_MISMATCH: u8 = 3;

/// Terminal event waiting in the mailbox
struct Delivery {
    handle: TransferHandle,
    outcome: Outcome,
    next: *mut Delivery,
}

/// Multi-producer push list drained by [`Engine::poll`].
///
/// Producers only ever push; the consumer takes the whole list at once, so
/// the list head is the single atomic both sides touch.
struct Mailbox {
    head: AtomicPtr<Delivery>,
}

impl Mailbox {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, handle: TransferHandle, outcome: Outcome) {
        let node = Box::into_raw(Box::new(Delivery {
            handle,
            outcome,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is owned here until the exchange publishes it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Takes every delivery, oldest first.
    fn take(&self) -> Vec<(TransferHandle, Outcome)> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut taken = Vec::new();
        while !node.is_null() {
            // SAFETY: every node came from `Box::into_raw` in `push` and was
            // unlinked from the shared head by the swap above.
            let delivery = unsafe { Box::from_raw(node) };
            node = delivery.next;
            taken.push((delivery.handle, delivery.outcome));
        }
        taken.reverse();
        taken
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// Outstanding request at one address
struct Transaction {
    handle: TransferHandle,
    command: Command,
    origin: &'static str,
    submitted: u64,
    deadline: u64,
    on_complete: OnComplete,
}

struct Slot {
    inflight: Mutex<Option<Transaction>>,
    evidence: AtomicU8,
    /// Sub-unit mask from the latest root-unit response (root slots only)
    hub: AtomicU8,
}

impl Slot {
    fn new() -> Self {
        Self {
            inflight: Mutex::new(None),
            evidence: AtomicU8::new(EVIDENCE_NONE),
            hub: AtomicU8::new(0),
        }
    }

    fn mark(&self, evidence: u8) {
        self.evidence.store(evidence, Ordering::Release);
    }
}

/// Per-address transaction engine.
pub struct Engine {
    transport: Box<dyn Transport>,
    slots: [Slot; SLOT_COUNT],
    mailbox: Mailbox,
    sequence: AtomicU32,
    now: AtomicU64,
    timeout_ticks: u64,
}

impl Engine {
    /// Creates an engine over `transport`.
    pub fn new(transport: Box<dyn Transport>, timeout_ticks: u64) -> Self {
        Self {
            transport,
            slots: core::array::from_fn(|_| Slot::new()),
            mailbox: Mailbox::new(),
            sequence: AtomicU32::new(1),
            now: AtomicU64::new(0),
            timeout_ticks: timeout_ticks.max(1),
        }
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Moves the engine clock to `now`.
    pub fn advance(&self, now: u64) {
        self.now.store(now, Ordering::Release);
    }

    /// Submits `command` to `address`.
    ///
    /// Never blocks. On success the engine owns the transaction until its
    /// terminal event and `on_complete` will run exactly once. On failure
    /// `on_complete` is dropped without running.
    pub fn submit<F>(
        &self,
        address: Address,
        command: Command,
        payload: Vec<u32>,
        origin: &'static str,
        on_complete: F,
    ) -> Result<TransferHandle, MapleError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let frame =
            Frame::request(command, address, payload).map_err(|_| MapleError::InvalidArgument)?;
        let slot = &self.slots[address.index()];
        let now = self.now();

        let handle = {
            let mut inflight = slot.inflight.lock();
            if inflight.is_some() {
                return Err(MapleError::AddressBusy);
            }
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let handle = TransferHandle::new(address.index(), sequence);
            *inflight = Some(Transaction {
                handle,
                command,
                origin,
                submitted: now,
                deadline: now + self.timeout_ticks,
                on_complete: Box::new(on_complete),
            });
            handle
        };

        if let Err(err) = self.transport.submit(handle, &frame) {
            log::warn!("maple: {} refused {:?} for {}: {:?}", address, command, origin, err);
            let refused = {
                let mut inflight = slot.inflight.lock();
                match inflight.as_ref() {
                    Some(txn) if txn.handle == handle => inflight.take(),
                    _ => None,
                }
            };
            drop(refused);
            return Err(MapleError::TransportUnavailable);
        }
        Ok(handle)
    }

    /// Hands over the terminal event for `handle`.
    ///
    /// Interrupt-safe: takes none of the engine's locks and runs no
    /// callback. The event is settled by the next [`Engine::poll`]. The
    /// event is boxed, so the global allocator must be usable from the
    /// caller's context, as it already is for the reply frame.
    pub fn complete(&self, handle: TransferHandle, outcome: Outcome) {
        self.mailbox.push(handle, outcome);
    }

    /// Settles every event handed over by [`Engine::complete`].
    ///
    /// Events for handles the engine no longer tracks (abandoned or expired)
    /// are discarded. Returns the number of callbacks run.
    pub fn poll(&self) -> usize {
        let mut settled = 0;
        for (handle, outcome) in self.mailbox.take() {
            let (Some(slot), Some(address)) =
                (self.slots.get(handle.slot()), Address::from_index(handle.slot()))
            else {
                log::trace!("maple: completion for unknown slot {:?}", handle);
                continue;
            };
            let txn = {
                let mut inflight = slot.inflight.lock();
                match inflight.as_ref() {
                    Some(txn) if txn.handle == handle => inflight.take(),
                    _ => None,
                }
            };
            let Some(txn) = txn else {
                log::trace!("maple: stale completion {:?} at {}", handle, address);
                continue;
            };
            let result = Self::settle(slot, address, outcome);
            if let Err(err) = &result {
                log::debug!(
                    "maple: {} {:?} from {} failed: {}",
                    address,
                    txn.command,
                    txn.origin,
                    err
                );
            }
            (txn.on_complete)(result);
            settled += 1;
        }
        settled
    }

    fn settle(slot: &Slot, address: Address, outcome: Outcome) -> Completion {
        let frame = match outcome {
            Ok(frame) => frame,
            Err(TransportFault::Timeout) => return Err(MapleError::TransportTimeout),
            Err(TransportFault::Dma) => return Err(MapleError::TransportUnavailable),
        };
        match frame.response() {
            Some(Response::None) => {
                slot.mark(EVIDENCE_SILENT);
                return Err(MapleError::NoResponse);
            }
            Some(Response::FunctionUnsupported) => {
                slot.mark(EVIDENCE_MISMATCH);
                return Err(MapleError::Refused(Response::FunctionUnsupported));
            }
            Some(code) if code.is_error() => {
                slot.mark(EVIDENCE_RESPONDED);
                return Err(MapleError::Refused(code));
            }
            Some(_) => {}
            None => return Err(MapleError::MalformedResponse),
        }
        if frame.source() != Some(address) {
            return Err(MapleError::MalformedResponse);
        }
        slot.mark(EVIDENCE_RESPONDED);
        if address.is_root() {
            slot.hub.store(frame.sub_units(), Ordering::Release);
        }
        Ok(frame)
    }

    /// Advances the engine clock and times out overdue transactions.
    ///
    /// A timeout leaves no presence evidence; the callback reports
    /// [`MapleError::TransportTimeout`]. Returns the number of transactions
    /// that expired.
    pub fn expire(&self, now: u64) -> usize {
        self.advance(now);
        let mut expired = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let txn = {
                let mut inflight = slot.inflight.lock();
                match inflight.as_ref() {
                    Some(txn) if txn.deadline <= now => inflight.take(),
                    _ => None,
                }
            };
            let Some(txn) = txn else { continue };
            self.transport.cancel(txn.handle);
            if let Some(address) = Address::from_index(index) {
                log::warn!(
                    "maple: {} {:?} from {} timed out after {} ticks",
                    address,
                    txn.command,
                    txn.origin,
                    now - txn.submitted
                );
            }
            (txn.on_complete)(Err(MapleError::TransportTimeout));
            expired += 1;
        }
        expired
    }

    /// Drops the outstanding transaction at `address`, if any.
    ///
    /// The callback runs with [`MapleError::DeviceGone`]; a transport
    /// completion arriving later is discarded.
    pub fn abandon(&self, address: Address) -> bool {
        let txn = self.slots[address.index()].inflight.lock().take();
        match txn {
            Some(txn) => {
                self.transport.cancel(txn.handle);
                log::trace!("maple: abandoned {:?} at {}", txn.command, address);
                (txn.on_complete)(Err(MapleError::DeviceGone));
                true
            }
            None => false,
        }
    }

    /// Abandons every outstanding transaction.
    pub fn abandon_all(&self) -> usize {
        Address::all().filter(|address| self.abandon(*address)).count()
    }

    /// True while a transaction is outstanding at `address`.
    pub fn is_busy(&self, address: Address) -> bool {
        self.slots[address.index()].inflight.lock().is_some()
    }

    /// Submit tick of the outstanding transaction at `address`.
    pub fn busy_since(&self, address: Address) -> Option<u64> {
        self.slots[address.index()]
            .inflight
            .lock()
            .as_ref()
            .map(|txn| txn.submitted)
    }

    /// Takes the presence evidence recorded since the last call.
    pub fn take_evidence(&self, address: Address) -> Option<Evidence> {
        match self.slots[address.index()]
            .evidence
            .swap(EVIDENCE_NONE, Ordering::AcqRel)
        {
            EVIDENCE_RESPONDED => Some(Evidence::Responded),
            EVIDENCE_SILENT => Some(Evidence::Silent),
            EVIDENCE_MISMATCH => Some(Evidence::Mismatch),
            _ => None,
        }
    }

    /// Sub-unit mask last reported by the root unit of `port`.
    pub fn hub_mask(&self, port: u8) -> u8 {
        if usize::from(port) >= PORT_COUNT {
            return 0;
        }
        match Address::root(port) {
            Some(root) => self.slots[root.index()].hub.load(Ordering::Acquire),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use alloc::sync::Arc;
    use alloc::vec;
    use maple_proto::{Capabilities, DeviceInfo};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(TransferHandle, Frame)>>>);

    impl Recorder {
        fn take(&self) -> Vec<(TransferHandle, Frame)> {
            core::mem::take(&mut *self.0.lock())
        }
    }

    impl Transport for Recorder {
        fn submit(&self, handle: TransferHandle, frame: &Frame) -> Result<(), TransportError> {
            self.0.lock().push((handle, frame.clone()));
            Ok(())
        }
    }

    struct Offline;

    impl Transport for Offline {
        fn submit(&self, _: TransferHandle, _: &Frame) -> Result<(), TransportError> {
            Err(TransportError::Offline)
        }
    }

    fn engine() -> (Engine, Recorder) {
        let recorder = Recorder::default();
        (Engine::new(Box::new(recorder.clone()), 1), recorder)
    }

    fn sink() -> (Arc<Mutex<Vec<Completion>>>, impl FnOnce(Completion) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        (seen, move |result| inner.lock().push(result))
    }

    fn a0() -> Address {
        Address::root(0).unwrap()
    }

    #[test]
    fn test_second_submit_is_busy() {
        let (engine, recorder) = engine();
        let (seen, cb) = sink();
        engine
            .submit(a0(), Command::DeviceInfo, vec![], "test", cb)
            .unwrap();
        let (_, cb2) = sink();
        assert_eq!(
            engine.submit(a0(), Command::DeviceInfo, vec![], "test", cb2),
            Err(MapleError::AddressBusy)
        );
        assert_eq!(recorder.take().len(), 1);
        assert!(seen.lock().is_empty());
        assert!(engine.is_busy(a0()));
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let (engine, recorder) = engine();
        let (seen, cb) = sink();
        let handle = engine
            .submit(a0(), Command::DeviceInfo, vec![], "test", cb)
            .unwrap();
        let (_, request) = recorder.take().pop().unwrap();
        let info = DeviceInfo::new(Capabilities::CONTROLLER, [0; 3], "pad", "lic");
        let reply = Frame::reply(&request, Response::DeviceInfo, 0b00011, info.to_words());

        engine.complete(handle, Ok(reply.clone()));
        engine.complete(handle, Ok(reply));
        assert!(seen.lock().is_empty());
        assert_eq!(engine.poll(), 1);

        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].is_ok());
        assert!(!engine.is_busy(a0()));
        assert_eq!(engine.take_evidence(a0()), Some(Evidence::Responded));
        assert_eq!(engine.take_evidence(a0()), None);
        assert_eq!(engine.hub_mask(0), 0b00011);
    }

    #[test]
    fn test_error_responses() {
        let (engine, recorder) = engine();
        let cases = [
            (Response::None, MapleError::NoResponse, Evidence::Silent),
            (
                Response::Again,
                MapleError::Refused(Response::Again),
                Evidence::Responded,
            ),
            (
                Response::FunctionUnsupported,
                MapleError::Refused(Response::FunctionUnsupported),
                Evidence::Mismatch,
            ),
        ];
        for (response, expected, evidence) in cases {
            let (seen, cb) = sink();
            let handle = engine
                .submit(a0(), Command::GetCondition, vec![1], "test", cb)
                .unwrap();
            let (_, request) = recorder.take().pop().unwrap();
            engine.complete(handle, Ok(Frame::reply(&request, response, 0, vec![])));
            engine.poll();
            assert_eq!(seen.lock()[0], Err(expected));
            assert_eq!(engine.take_evidence(a0()), Some(evidence));
        }
    }

    #[test]
    fn test_misaddressed_response_is_malformed() {
        let (engine, recorder) = engine();
        let (seen, cb) = sink();
        let handle = engine
            .submit(a0(), Command::GetCondition, vec![], "test", cb)
            .unwrap();
        let (_, mut request) = recorder.take().pop().unwrap();
        request.recipient = Address::root(1).unwrap().to_wire();
        engine.complete(handle, Ok(Frame::reply(&request, Response::Ok, 0, vec![])));
        engine.poll();
        assert_eq!(seen.lock()[0], Err(MapleError::MalformedResponse));
    }

    #[test]
    fn test_expire_times_out() {
        let (engine, _recorder) = engine();
        let (seen, cb) = sink();
        let handle = engine
            .submit(a0(), Command::GetCondition, vec![], "test", cb)
            .unwrap();
        assert_eq!(engine.busy_since(a0()), Some(0));
        assert_eq!(engine.expire(0), 0);
        assert_eq!(engine.expire(1), 1);
        assert_eq!(seen.lock()[0], Err(MapleError::TransportTimeout));
        // A slow unit is not reported absent
        assert_eq!(engine.take_evidence(a0()), None);

        // Late completion after the timeout is ignored
        engine.complete(handle, Err(TransportFault::Dma));
        assert_eq!(engine.poll(), 0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_abandon_discards_late_completion() {
        let (engine, recorder) = engine();
        let (seen, cb) = sink();
        let old = engine
            .submit(a0(), Command::GetCondition, vec![], "test", cb)
            .unwrap();
        assert!(engine.abandon(a0()));
        assert!(!engine.abandon(a0()));
        assert_eq!(seen.lock()[0], Err(MapleError::DeviceGone));

        let (fresh, cb) = sink();
        let new = engine
            .submit(a0(), Command::GetCondition, vec![], "test", cb)
            .unwrap();
        assert_ne!(old, new);
        let (_, request) = recorder.take().pop().unwrap();
        engine.complete(old, Ok(Frame::reply(&request, Response::Ok, 0, vec![])));
        assert_eq!(engine.poll(), 0);
        assert!(fresh.lock().is_empty());
        assert!(engine.is_busy(a0()));
    }

    #[test]
    fn test_transport_offline() {
        let engine = Engine::new(Box::new(Offline), 1);
        let (seen, cb) = sink();
        assert_eq!(
            engine.submit(a0(), Command::DeviceInfo, vec![], "test", cb),
            Err(MapleError::TransportUnavailable)
        );
        assert!(!engine.is_busy(a0()));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_callback_may_chain_submission() {
        let recorder = Recorder::default();
        let engine = Arc::new(Engine::new(Box::new(recorder.clone()), 1));
        let chained = engine.clone();
        let handle = engine
            .submit(a0(), Command::BlockWrite, vec![], "test", move |_| {
                let _ = chained.submit(a0(), Command::BlockSync, vec![], "test", |_| {});
            })
            .unwrap();
        let (_, request) = recorder.take().pop().unwrap();
        engine.complete(handle, Ok(Frame::reply(&request, Response::Ok, 0, vec![])));
        engine.poll();

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.code, Command::BlockSync.code());
    }

    #[test]
    fn test_complete_takes_no_slot_lock() {
        let (engine, recorder) = engine();
        let (seen, cb) = sink();
        let handle = engine
            .submit(a0(), Command::GetCondition, vec![], "test", cb)
            .unwrap();
        let (_, request) = recorder.take().pop().unwrap();

        // Interrupt arrives while the tick context holds the slot
        let guard = engine.slots[a0().index()].inflight.lock();
        engine.complete(handle, Ok(Frame::reply(&request, Response::Ok, 0, vec![])));
        drop(guard);

        assert!(seen.lock().is_empty());
        assert_eq!(engine.poll(), 1);
        assert_eq!(seen.lock()[0].as_ref().map(|f| f.code), Ok(Response::Ok.code()));
    }

    #[test]
    fn test_poll_keeps_arrival_order() {
        let (engine, recorder) = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        for port in 0..3u8 {
            let address = Address::root(port).unwrap();
            let order = order.clone();
            engine
                .submit(address, Command::GetCondition, vec![], "test", move |_| {
                    order.lock().push(port)
                })
                .unwrap();
        }
        let sent = recorder.take();
        for (handle, request) in sent.iter().rev() {
            engine.complete(*handle, Ok(Frame::reply(request, Response::Ok, 0, vec![])));
        }
        assert_eq!(engine.poll(), 3);
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }
}
