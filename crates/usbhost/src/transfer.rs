//! Asynchronous transfers
//!
//! A [`Transfer`] is one control or bulk operation against an open device.
//! It moves through `Idle -> Submitted -> Finished(status)` and can be
//! resubmitted once finished. The finished state is only ever reached inside
//! [`Session::process_events`](crate::Session::process_events), which also
//! calls the transfer's [`TransferHandler`].
//!
//! # Ownership
//!
//! The caller owns the `Transfer`, its handler included. While it is in
//! flight the backend holds the buffer and the session only keeps a weak
//! reference to the transfer's state, so nothing a handler owns (a
//! [`Device`] clone, say) can keep the session alive on its own.
//!
//! Dropping an in-flight transfer requests cancellation and drops the
//! handler with it. The terminal event still shows up in the list returned
//! by `process_events`, but no handler runs for it.
//!
//! Handlers run with no borrow held on their transfer, so a handler may
//! inspect, resubmit or drop the transfer it was called for.

use crate::backend::{
    Backend, ControlSetup, RawCompletion, TransferId, TransferKind, TransferRequest,
    TransferStatus,
};
use crate::device::Device;
use crate::error::{Error, Result, SubmitError};
use crate::libusb::Libusb;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a transfer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Submitted,
    Finished(TransferStatus),
}

/// One dispatched completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub id: TransferId,
    pub kind: TransferKind,
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Receives the terminal status of each submission
///
/// [`dispatch`](Self::dispatch) is the single entry point called by the event
/// processor; it routes to one hook per status. Only `on_complete` has to be
/// written, the others log the outcome by default.
pub trait TransferHandler {
    /// Transfer finished successfully; `data` holds the received bytes
    fn on_complete(&mut self, event: &TransferEvent, data: &[u8]);

    fn on_cancel(&mut self, event: &TransferEvent) {
        debug!("Transfer {:?} cancelled", event.id);
    }

    fn on_error(&mut self, event: &TransferEvent) {
        warn!(
            "Transfer {:?} on endpoint {:#04x} failed",
            event.id,
            event.kind.endpoint()
        );
    }

    fn on_no_device(&mut self, event: &TransferEvent) {
        warn!("Transfer {:?}: device is gone", event.id);
    }

    fn on_overflow(&mut self, event: &TransferEvent) {
        warn!(
            "Transfer {:?} overflowed after {} bytes",
            event.id, event.actual_length
        );
    }

    fn on_stall(&mut self, event: &TransferEvent) {
        warn!(
            "Transfer {:?}: endpoint {:#04x} stalled",
            event.id,
            event.kind.endpoint()
        );
    }

    fn on_timeout(&mut self, event: &TransferEvent) {
        warn!(
            "Transfer {:?} timed out after {} bytes",
            event.id, event.actual_length
        );
    }

    fn dispatch(&mut self, event: &TransferEvent, data: &[u8]) {
        match event.status {
            TransferStatus::Completed => self.on_complete(event, data),
            TransferStatus::Cancelled => self.on_cancel(event),
            TransferStatus::Error => self.on_error(event),
            TransferStatus::NoDevice => self.on_no_device(event),
            TransferStatus::Overflow => self.on_overflow(event),
            TransferStatus::Stalled => self.on_stall(event),
            TransferStatus::TimedOut => self.on_timeout(event),
        }
    }
}

/// Handler used when none is attached: logs every outcome
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl TransferHandler for LogHandler {
    fn on_complete(&mut self, event: &TransferEvent, _data: &[u8]) {
        debug!(
            "Transfer {:?} completed: {} bytes",
            event.id, event.actual_length
        );
    }
}

/// State shared between a [`Transfer`] and the session's in-flight table
pub(crate) struct TransferSlot {
    kind: TransferKind,
    state: TransferState,
    id: Option<TransferId>,
    /// None while the library owns the buffer
    buffer: Option<Vec<u8>>,
    actual_length: usize,
    /// None while the handler is being dispatched
    handler: Option<Box<dyn TransferHandler>>,
}

impl TransferSlot {
    fn received(&self) -> Option<&[u8]> {
        self.buffer
            .as_deref()
            .map(|buffer| &buffer[..self.actual_length.min(buffer.len())])
    }
}

pub struct Transfer<B: Backend = Libusb> {
    device: Device<B>,
    kind: TransferKind,
    timeout: Duration,
    slot: Rc<RefCell<TransferSlot>>,
}

impl<B: Backend> Transfer<B> {
    /// Control transfer on endpoint 0 with a data stage of `length` bytes
    ///
    /// For host-to-device requests, fill the payload through
    /// [`buffer_mut`](Self::buffer_mut) before submitting.
    pub fn control(device: &Device<B>, setup: ControlSetup, length: u16) -> Self {
        Self::new(device, TransferKind::Control(setup), length as usize)
    }

    /// Bulk transfer on `endpoint` with a buffer of `buffer_size` bytes
    pub fn bulk(device: &Device<B>, endpoint: u8, buffer_size: usize) -> Self {
        Self::new(device, TransferKind::Bulk { endpoint }, buffer_size)
    }

    fn new(device: &Device<B>, kind: TransferKind, buffer_size: usize) -> Self {
        Self {
            device: device.clone(),
            kind,
            timeout: device.session().settings().transfer_timeout(),
            slot: Rc::new(RefCell::new(TransferSlot {
                kind,
                state: TransferState::Idle,
                id: None,
                buffer: Some(vec![0; buffer_size]),
                actual_length: 0,
                handler: Some(Box::new(LogHandler)),
            })),
        }
    }

    /// Override the session's default timeout (zero = no timeout)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_handler(self, handler: impl TransferHandler + 'static) -> Self {
        self.slot.borrow_mut().handler = Some(Box::new(handler));
        self
    }

    /// Hand the transfer to the library
    ///
    /// The outcome arrives through a later `process_events` call.
    pub fn submit(&self) -> Result<()> {
        let mut slot = self.slot.borrow_mut();
        if slot.state == TransferState::Submitted {
            return Err(Error::Submission(SubmitError::InFlight));
        }

        let Some(handle) = self.device.handle() else {
            warn!("Cannot submit transfer: device {} is not open", self.device);
            return Err(Error::Submission(SubmitError::DeviceNotOpen));
        };

        let session = self.device.session();
        let id = session.next_transfer_id();
        let request = TransferRequest {
            id,
            kind: self.kind,
            timeout: self.timeout,
            buffer: slot.buffer.take().unwrap_or_default(),
        };

        if let Err(rejected) = session.backend().submit(&handle, request) {
            warn!("Transfer {:?} rejected: {}", id, rejected.error);
            slot.buffer = Some(rejected.buffer);
            return Err(Error::Submission(SubmitError::Rejected(rejected.error)));
        }
        drop(handle);

        slot.state = TransferState::Submitted;
        slot.id = Some(id);
        slot.actual_length = 0;
        drop(slot);

        session.track(id, self.kind, Rc::downgrade(&self.slot));
        debug!(
            "Submitted transfer {:?} ({:?}) to device {}",
            id, self.kind, self.device
        );
        Ok(())
    }

    /// Ask the library to cancel the transfer if it is in flight
    ///
    /// The cancellation is reported by a later `process_events` call.
    pub fn cancel(&self) -> Result<()> {
        let id = match *self.slot.borrow() {
            TransferSlot {
                state: TransferState::Submitted,
                id: Some(id),
                ..
            } => id,
            _ => {
                debug!("Transfer is not in flight, nothing to cancel");
                return Ok(());
            }
        };

        match self.device.session().backend().cancel(id) {
            Ok(()) => {
                debug!("Requested cancellation of transfer {:?}", id);
                Ok(())
            }
            // Finished before the request reached the library
            Err(rusb::Error::NotFound) => Ok(()),
            Err(e) => {
                warn!("Failed to cancel transfer {:?}: {}", id, e);
                Err(Error::Cancel(e))
            }
        }
    }

    /// True only once the last submission completed successfully
    pub fn is_complete(&self) -> bool {
        self.state() == TransferState::Finished(TransferStatus::Completed)
    }

    pub fn state(&self) -> TransferState {
        self.slot.borrow().state
    }

    /// Id of the most recent submission
    pub fn id(&self) -> Option<TransferId> {
        self.slot.borrow().id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn device(&self) -> &Device<B> {
        &self.device
    }

    /// Bytes transferred by the last finished submission
    pub fn actual_length(&self) -> usize {
        self.slot.borrow().actual_length
    }

    /// Whole buffer, or None while in flight
    pub fn buffer(&self) -> Option<Ref<'_, [u8]>> {
        Ref::filter_map(self.slot.borrow(), |slot| slot.buffer.as_deref()).ok()
    }

    /// Bytes received by the last finished submission, or None while in flight
    pub fn data(&self) -> Option<Ref<'_, [u8]>> {
        Ref::filter_map(self.slot.borrow(), TransferSlot::received).ok()
    }

    /// Writable buffer for outgoing payloads
    pub fn buffer_mut(&self) -> Result<RefMut<'_, [u8]>> {
        RefMut::filter_map(self.slot.borrow_mut(), |slot| slot.buffer.as_deref_mut())
            .map_err(|_| Error::Submission(SubmitError::InFlight))
    }
}

impl<B: Backend> Drop for Transfer<B> {
    fn drop(&mut self) {
        if self.state() == TransferState::Submitted
            && let Err(e) = self.cancel()
        {
            warn!("Dropped in-flight transfer could not be cancelled: {}", e);
        }
    }
}

impl<B: Backend> fmt::Debug for Transfer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.borrow();
        f.debug_struct("Transfer")
            .field("kind", &self.kind)
            .field("state", &slot.state)
            .field("id", &slot.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Record a completion in its slot and run the slot's handler
///
/// The slot is only borrowed to update it. The handler is taken out for the
/// call and gets a copy of the received bytes, so it may resubmit the
/// transfer (which hands the buffer back to the backend) from inside a hook.
pub(crate) fn finish(
    slot: &Rc<RefCell<TransferSlot>>,
    completion: RawCompletion,
) -> TransferEvent {
    let RawCompletion {
        id,
        status,
        actual_length,
        buffer,
    } = completion;

    let (event, handler, data) = {
        let mut slot = slot.borrow_mut();
        slot.buffer = Some(buffer);
        slot.actual_length = actual_length;
        slot.state = TransferState::Finished(status);

        let event = TransferEvent {
            id,
            kind: slot.kind,
            status,
            actual_length,
        };
        let data = slot.received().map(<[u8]>::to_vec).unwrap_or_default();
        (event, slot.handler.take(), data)
    };

    if let Some(mut handler) = handler {
        handler.dispatch(&event, &data);
        let mut slot = slot.borrow_mut();
        if slot.handler.is_none() {
            slot.handler = Some(handler);
        }
    }

    event
}

/// Terminal event of a transfer that was dropped while in flight
pub(crate) fn orphaned(kind: TransferKind, completion: &RawCompletion) -> TransferEvent {
    debug!(
        "Transfer {:?} finished after its owner was dropped ({:?})",
        completion.id, completion.status
    );
    TransferEvent {
        id: completion.id,
        kind,
        status: completion.status,
        actual_length: completion.actual_length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        hooks: Vec<&'static str>,
    }

    impl TransferHandler for Counting {
        fn on_complete(&mut self, _event: &TransferEvent, _data: &[u8]) {
            self.hooks.push("complete");
        }

        fn on_cancel(&mut self, _event: &TransferEvent) {
            self.hooks.push("cancel");
        }

        fn on_stall(&mut self, _event: &TransferEvent) {
            self.hooks.push("stall");
        }
    }

    fn event(status: TransferStatus) -> TransferEvent {
        TransferEvent {
            id: TransferId(1),
            kind: TransferKind::Bulk { endpoint: 0x81 },
            status,
            actual_length: 0,
        }
    }

    #[test]
    fn test_dispatch_routes_by_status() {
        let mut handler = Counting::default();
        handler.dispatch(&event(TransferStatus::Completed), &[]);
        handler.dispatch(&event(TransferStatus::Cancelled), &[]);
        handler.dispatch(&event(TransferStatus::Stalled), &[]);
        // Default hooks only log
        handler.dispatch(&event(TransferStatus::TimedOut), &[]);
        handler.dispatch(&event(TransferStatus::Error), &[]);

        assert_eq!(handler.hooks, vec!["complete", "cancel", "stall"]);
    }

    #[test]
    fn test_log_handler_accepts_every_status() {
        let mut handler = LogHandler;
        for status in [
            TransferStatus::Completed,
            TransferStatus::Cancelled,
            TransferStatus::Error,
            TransferStatus::NoDevice,
            TransferStatus::Overflow,
            TransferStatus::Stalled,
            TransferStatus::TimedOut,
        ] {
            handler.dispatch(&event(status), &[]);
        }
    }

    #[test]
    fn test_finish_records_completion() {
        let slot = Rc::new(RefCell::new(TransferSlot {
            kind: TransferKind::Bulk { endpoint: 0x81 },
            state: TransferState::Submitted,
            id: Some(TransferId(7)),
            buffer: None,
            actual_length: 0,
            handler: Some(Box::new(LogHandler)),
        }));

        let event = finish(
            &slot,
            RawCompletion {
                id: TransferId(7),
                status: TransferStatus::Completed,
                actual_length: 3,
                buffer: vec![1, 2, 3, 0],
            },
        );

        assert_eq!(event.actual_length, 3);
        let slot = slot.borrow();
        assert_eq!(slot.state, TransferState::Finished(TransferStatus::Completed));
        assert_eq!(slot.received(), Some(&[1u8, 2, 3][..]));
    }
}
