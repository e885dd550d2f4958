//! In-memory backend for tests
//!
//! [`MockBackend`] stands in for the native library: devices are added by
//! the test, transfers complete on the next `handle_events` call with a
//! scripted (or default successful) outcome, and every call that reaches the
//! "library" is recorded so ordering can be asserted.
//!
//! # Example
//!
//! ```
//! use usbhost::mock::{MockBackend, mock_device_info};
//! use usbhost::{Session, SessionSettings};
//!
//! let mock = MockBackend::new();
//! mock.add_device(mock_device_info(0x1234, 0x5678));
//!
//! let session = Session::with_backend(mock.clone(), &SessionSettings::default());
//! let devices = session.enumerate_devices().unwrap();
//! assert_eq!(devices[0].info().vendor_id, 0x1234);
//! ```

use crate::backend::{
    Backend, DeviceInfo, RawCompletion, Rejected, TransferId, TransferKind, TransferRequest,
    TransferStatus,
};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Calls that reached the mock library, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open(usize),
    Close(usize),
    Claim(usize, u8),
    Release(usize, u8),
    Submit(TransferId),
    Cancel(TransferId),
}

/// Scripted result for the next transfer on an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOutcome {
    pub status: TransferStatus,
    /// Bytes "received" for IN transfers
    pub data: Vec<u8>,
}

/// Index of a mock device, as returned by [`MockBackend::add_device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDevice(pub usize);

#[derive(Debug)]
pub struct MockHandle {
    device: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Rc<RefCell<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<DeviceEntry>,
    enumerate_error: Option<rusb::Error>,
    events_error: Option<rusb::Error>,
    submit_error: Option<rusb::Error>,
    hold_transfers: bool,
    open_handles: usize,
    outcomes: HashMap<u8, VecDeque<MockOutcome>>,
    pending: Vec<PendingTransfer>,
    calls: Vec<MockCall>,
}

#[derive(Debug)]
struct DeviceEntry {
    info: DeviceInfo,
    descriptor_error: Option<rusb::Error>,
    open_error: Option<rusb::Error>,
    claim_errors: HashMap<u8, rusb::Error>,
    release_errors: HashMap<u8, rusb::Error>,
    /// Library-side view of claimed interfaces
    claimed: BTreeSet<u8>,
    unplugged: bool,
}

#[derive(Debug)]
struct PendingTransfer {
    id: TransferId,
    device: usize,
    kind: TransferKind,
    buffer: Vec<u8>,
    cancelled: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device; it shows up in the next enumeration
    pub fn add_device(&self, info: DeviceInfo) -> usize {
        let mut state = self.state.borrow_mut();
        state.devices.push(DeviceEntry {
            info,
            descriptor_error: None,
            open_error: None,
            claim_errors: HashMap::new(),
            release_errors: HashMap::new(),
            claimed: BTreeSet::new(),
            unplugged: false,
        });
        state.devices.len() - 1
    }

    pub fn fail_enumeration(&self, error: rusb::Error) {
        self.state.borrow_mut().enumerate_error = Some(error);
    }

    pub fn fail_descriptor(&self, device: usize, error: rusb::Error) {
        self.state.borrow_mut().devices[device].descriptor_error = Some(error);
    }

    pub fn fail_open(&self, device: usize, error: rusb::Error) {
        self.state.borrow_mut().devices[device].open_error = Some(error);
    }

    pub fn fail_claim(&self, device: usize, interface: u8, error: rusb::Error) {
        self.state.borrow_mut().devices[device]
            .claim_errors
            .insert(interface, error);
    }

    pub fn fail_release(&self, device: usize, interface: u8, error: rusb::Error) {
        self.state.borrow_mut().devices[device]
            .release_errors
            .insert(interface, error);
    }

    /// Make every following submission fail (None to stop)
    pub fn fail_submit(&self, error: Option<rusb::Error>) {
        self.state.borrow_mut().submit_error = error;
    }

    pub fn fail_events(&self, error: rusb::Error) {
        self.state.borrow_mut().events_error = Some(error);
    }

    /// Disconnect a device: opens fail and its transfers end with `NoDevice`
    pub fn unplug(&self, device: usize) {
        self.state.borrow_mut().devices[device].unplugged = true;
    }

    /// While holding, only cancelled transfers finish on `handle_events`
    pub fn hold_transfers(&self, hold: bool) {
        self.state.borrow_mut().hold_transfers = hold;
    }

    /// Queue the outcome of the next transfer on `endpoint`
    pub fn push_outcome(&self, endpoint: u8, status: TransferStatus, data: Vec<u8>) {
        self.state
            .borrow_mut()
            .outcomes
            .entry(endpoint)
            .or_default()
            .push_back(MockOutcome { status, data });
    }

    /// Interfaces the mock library currently considers claimed
    pub fn claimed_interfaces(&self, device: usize) -> Vec<u8> {
        self.state.borrow().devices[device]
            .claimed
            .iter()
            .copied()
            .collect()
    }

    pub fn open_handles(&self) -> usize {
        self.state.borrow().open_handles
    }

    pub fn pending_transfers(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Payload of the most recent submission, as the library saw it
    pub fn last_submitted(&self) -> Option<(TransferKind, Vec<u8>)> {
        self.state
            .borrow()
            .pending
            .last()
            .map(|p| (p.kind, p.buffer.clone()))
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }
}

impl MockState {
    fn finish(&mut self, pending: PendingTransfer) -> RawCompletion {
        let PendingTransfer {
            id,
            device,
            kind,
            mut buffer,
            cancelled,
        } = pending;

        let (status, actual_length) = if cancelled {
            (TransferStatus::Cancelled, 0)
        } else if self.devices[device].unplugged {
            (TransferStatus::NoDevice, 0)
        } else {
            match self
                .outcomes
                .get_mut(&kind.endpoint())
                .and_then(VecDeque::pop_front)
            {
                Some(MockOutcome { status, data }) if kind.is_in() => {
                    let length = data.len().min(buffer.len());
                    buffer[..length].copy_from_slice(&data[..length]);
                    (status, length)
                }
                Some(MockOutcome { status, .. }) => {
                    let length = if status.is_success() { buffer.len() } else { 0 };
                    (status, length)
                }
                None => (TransferStatus::Completed, buffer.len()),
            }
        };

        RawCompletion {
            id,
            status,
            actual_length,
            buffer,
        }
    }
}

impl Backend for MockBackend {
    type Device = MockDevice;
    type Handle = MockHandle;

    fn devices(&self) -> rusb::Result<Vec<Self::Device>> {
        let state = self.state.borrow();
        if let Some(error) = state.enumerate_error {
            return Err(error);
        }

        Ok((0..state.devices.len())
            .filter(|&i| !state.devices[i].unplugged)
            .map(MockDevice)
            .collect())
    }

    fn device_info(&self, device: &Self::Device) -> rusb::Result<DeviceInfo> {
        let state = self.state.borrow();
        let entry = &state.devices[device.0];
        match entry.descriptor_error {
            Some(error) => Err(error),
            None => Ok(entry.info.clone()),
        }
    }

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle> {
        let mut state = self.state.borrow_mut();
        let entry = &state.devices[device.0];
        if entry.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if let Some(error) = entry.open_error {
            return Err(error);
        }

        state.open_handles += 1;
        state.calls.push(MockCall::Open(device.0));
        Ok(MockHandle { device: device.0 })
    }

    fn close(&self, handle: Self::Handle) {
        let mut state = self.state.borrow_mut();
        state.open_handles -= 1;
        state.calls.push(MockCall::Close(handle.device));
    }

    fn claim_interface(&self, handle: &Self::Handle, interface: u8) -> rusb::Result<()> {
        let mut state = self.state.borrow_mut();
        let entry = &mut state.devices[handle.device];
        if entry.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if let Some(error) = entry.claim_errors.get(&interface) {
            return Err(*error);
        }
        if !entry.claimed.insert(interface) {
            return Err(rusb::Error::Busy);
        }

        state.calls.push(MockCall::Claim(handle.device, interface));
        Ok(())
    }

    fn release_interface(&self, handle: &Self::Handle, interface: u8) -> rusb::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(MockCall::Release(handle.device, interface));

        let entry = &mut state.devices[handle.device];
        if let Some(error) = entry.release_errors.get(&interface) {
            return Err(*error);
        }
        if !entry.claimed.remove(&interface) {
            return Err(rusb::Error::NotFound);
        }
        Ok(())
    }

    fn submit(&self, handle: &Self::Handle, request: TransferRequest) -> Result<(), Rejected> {
        let mut state = self.state.borrow_mut();
        let error = match state.submit_error {
            Some(error) => Some(error),
            None if state.devices[handle.device].unplugged => Some(rusb::Error::NoDevice),
            None => None,
        };
        if let Some(error) = error {
            return Err(Rejected {
                error,
                buffer: request.buffer,
            });
        }

        state.calls.push(MockCall::Submit(request.id));
        state.pending.push(PendingTransfer {
            id: request.id,
            device: handle.device,
            kind: request.kind,
            buffer: request.buffer,
            cancelled: false,
        });
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> rusb::Result<()> {
        let mut state = self.state.borrow_mut();
        let pending = state
            .pending
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(rusb::Error::NotFound)?;
        pending.cancelled = true;
        state.calls.push(MockCall::Cancel(id));
        Ok(())
    }

    fn handle_events(&self, _timeout: Option<Duration>) -> rusb::Result<Vec<RawCompletion>> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.events_error.take() {
            return Err(error);
        }

        let hold = state.hold_transfers;
        let (finished, still_pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| !hold || p.cancelled);
        state.pending = still_pending;

        Ok(finished.into_iter().map(|p| state.finish(p)).collect())
    }
}

/// Descriptor summary for a full-speed device at bus 1, address 1
pub fn mock_device_info(vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        bus_number: 1,
        address: 1,
        port_number: 1,
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        speed: rusb::Speed::Full,
        num_configurations: 1,
    }
}
