//! USB session
//!
//! A [`Session`] owns the native library context and the table of in-flight
//! transfers. It is a counted handle: every [`Device`] keeps a clone, so the
//! context stays initialized until the last device (and the caller's own
//! clones) are gone.
//!
//! Completions are only delivered from [`Session::process_events`]; there is
//! no background thread.
//!
//! The in-flight table never owns a transfer's state. Transfers own their
//! handlers and handlers may own devices, so a strong entry would let an
//! abandoned transfer keep its device and this session alive forever.

use crate::backend::{Backend, TransferId, TransferKind};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::libusb::Libusb;
use crate::transfer::{self, TransferEvent, TransferSlot};
use common::{DeviceFilter, SessionSettings};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Session<B: Backend = Libusb> {
    inner: Rc<SessionInner<B>>,
}

struct SessionInner<B: Backend> {
    /// Submitted transfers without a terminal event yet
    in_flight: RefCell<HashMap<TransferId, InFlight>>,
    next_transfer_id: Cell<u64>,
    settings: SessionSettings,
    backend: B,
}

impl Session<Libusb> {
    /// Initialize the native USB library
    pub fn new(settings: &SessionSettings) -> Result<Self> {
        let backend = Libusb::new(settings).map_err(|e| {
            warn!("Failed to initialize USB library: {}", e);
            Error::Initialization(e)
        })?;
        Ok(Self::with_backend(backend, settings))
    }
}

/// In-flight table entry; the transfer may be gone by the time it finishes
struct InFlight {
    kind: TransferKind,
    slot: Weak<RefCell<TransferSlot>>,
}

impl<B: Backend> Session<B> {
    pub fn with_backend(backend: B, settings: &SessionSettings) -> Self {
        info!(
            "USB session started (debug level {:?}, event timeout {:?})",
            settings.debug_level,
            settings.event_timeout()
        );
        Self {
            inner: Rc::new(SessionInner {
                in_flight: RefCell::new(HashMap::new()),
                next_transfer_id: Cell::new(1),
                settings: settings.clone(),
                backend,
            }),
        }
    }

    /// Every device currently visible, in the order the library lists them
    ///
    /// Devices whose descriptor cannot be read are skipped.
    pub fn enumerate_devices(&self) -> Result<Vec<Device<B>>> {
        let raw_devices = self.inner.backend.devices().map_err(|e| {
            warn!("Failed to get device list: {}", e);
            Error::Initialization(e)
        })?;

        let mut devices = Vec::with_capacity(raw_devices.len());
        for raw in raw_devices {
            match self.inner.backend.device_info(&raw) {
                Ok(info) => devices.push(Device::new(self.clone(), raw, info)),
                Err(e) => warn!("Skipping device with unreadable descriptor: {}", e),
            }
        }

        debug!("Enumerated {} devices", devices.len());
        Ok(devices)
    }

    /// Enumerate, keeping only devices that pass `filter`
    pub fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device<B>>> {
        let devices: Vec<_> = self
            .enumerate_devices()?
            .into_iter()
            .filter(|device| {
                let info = device.info();
                filter.matches(info.vendor_id, info.product_id)
            })
            .collect();

        debug!("{} devices match filter {}", devices.len(), filter);
        Ok(devices)
    }

    /// Enumerate, keeping devices allowed by any of `filters`
    ///
    /// An empty list allows every device, matching `[devices] filters` in
    /// the config file.
    pub fn allowed_devices(&self, filters: &[DeviceFilter]) -> Result<Vec<Device<B>>> {
        Ok(self
            .enumerate_devices()?
            .into_iter()
            .filter(|device| {
                let info = device.info();
                DeviceFilter::any_matches(filters, info.vendor_id, info.product_id)
            })
            .collect())
    }

    /// Run pending completions, waiting as configured by the session settings
    ///
    /// Each finished transfer is dispatched to its handler and returned as a
    /// [`TransferEvent`], in the order the library reported them.
    pub fn process_events(&self) -> Result<Vec<TransferEvent>> {
        self.dispatch_events(self.inner.settings.event_timeout())
    }

    /// Like [`process_events`](Self::process_events) with an explicit wait bound
    pub fn process_events_timeout(&self, timeout: Duration) -> Result<Vec<TransferEvent>> {
        self.dispatch_events(Some(timeout))
    }

    /// Number of submitted transfers still waiting for a terminal event
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.borrow().len()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub(crate) fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub(crate) fn next_transfer_id(&self) -> TransferId {
        let id = self.inner.next_transfer_id.get();
        self.inner.next_transfer_id.set(id + 1);
        TransferId(id)
    }

    pub(crate) fn track(
        &self,
        id: TransferId,
        kind: TransferKind,
        slot: Weak<RefCell<TransferSlot>>,
    ) {
        self.inner
            .in_flight
            .borrow_mut()
            .insert(id, InFlight { kind, slot });
    }

    fn dispatch_events(&self, timeout: Option<Duration>) -> Result<Vec<TransferEvent>> {
        let completions = match self.inner.backend.handle_events(timeout) {
            Ok(completions) => completions,
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                return Err(Error::Events(e));
            }
        };

        let mut events = Vec::with_capacity(completions.len());
        for completion in completions {
            // Table borrow ends here; a handler may submit other transfers
            let entry = self.inner.in_flight.borrow_mut().remove(&completion.id);
            let Some(InFlight { kind, slot }) = entry else {
                warn!("Completion for untracked transfer {:?}", completion.id);
                continue;
            };
            match slot.upgrade() {
                Some(slot) => events.push(transfer::finish(&slot, completion)),
                None => events.push(transfer::orphaned(kind, &completion)),
            }
        }

        Ok(events)
    }
}

impl<B: Backend> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: Backend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("settings", &self.inner.settings)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<B: Backend> Drop for SessionInner<B> {
    fn drop(&mut self) {
        let outstanding = self.in_flight.get_mut().len();
        if outstanding > 0 {
            debug!(
                "USB session closing with {} transfers in flight",
                outstanding
            );
        }
        info!("USB session stopped");
    }
}
