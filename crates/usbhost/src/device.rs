//! USB device wrapper
//!
//! A [`Device`] is one enumerated device together with its open handle and
//! the set of interfaces claimed through it. Devices only come from
//! [`Session::enumerate_devices`]; clones share the same handle and claim set.
//! When the last clone is dropped, claimed interfaces are released and the
//! handle is closed.

use crate::backend::{Backend, DeviceInfo};
use crate::error::{Error, InterfaceState, Result};
use crate::libusb::Libusb;
use crate::session::Session;
use std::cell::{Ref, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

pub struct Device<B: Backend = Libusb> {
    inner: Rc<DeviceInner<B>>,
}

struct DeviceInner<B: Backend> {
    raw: B::Device,
    /// Cached device descriptor summary
    info: DeviceInfo,
    state: RefCell<DeviceState<B>>,
    /// Keeps the library context alive while this device exists
    session: Session<B>,
}

struct DeviceState<B: Backend> {
    handle: Option<B::Handle>,
    claimed: BTreeSet<u8>,
}

impl<B: Backend> Device<B> {
    pub(crate) fn new(session: Session<B>, raw: B::Device, info: DeviceInfo) -> Self {
        Self {
            inner: Rc::new(DeviceInner {
                raw,
                info,
                state: RefCell::new(DeviceState {
                    handle: None,
                    claimed: BTreeSet::new(),
                }),
                session,
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn session(&self) -> &Session<B> {
        &self.inner.session
    }

    /// Open the device for interface claims and transfers
    ///
    /// Opening an already open device does nothing.
    pub fn open(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.handle.is_some() {
            return Ok(());
        }

        let handle = self.backend().open(&self.inner.raw).map_err(|e| {
            warn!("Failed to open device {}: {}", self, e);
            Error::DeviceOpen(e)
        })?;

        state.handle = Some(handle);
        debug!("Opened device {}", self);
        Ok(())
    }

    /// Release all claimed interfaces, then close the handle
    ///
    /// Closing a closed device does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().handle.is_some()
    }

    /// Claim an interface on the open device
    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let DeviceState { handle, claimed } = &mut *state;
        let handle = handle.as_ref().ok_or(Error::NotOpen)?;

        if claimed.contains(&interface) {
            return Err(Error::InterfaceState {
                interface,
                state: InterfaceState::AlreadyClaimed,
            });
        }

        self.backend()
            .claim_interface(handle, interface)
            .map_err(|source| {
                warn!("Failed to claim interface {} on {}: {}", interface, self, source);
                Error::Interface { interface, source }
            })?;

        claimed.insert(interface);
        debug!("Claimed interface {} on device {}", interface, self);
        Ok(())
    }

    /// Release a previously claimed interface
    pub fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let DeviceState { handle, claimed } = &mut *state;
        let handle = handle.as_ref().ok_or(Error::NotOpen)?;

        if !claimed.contains(&interface) {
            return Err(Error::InterfaceState {
                interface,
                state: InterfaceState::NotClaimed,
            });
        }

        self.backend()
            .release_interface(handle, interface)
            .map_err(|source| Error::Interface { interface, source })?;

        claimed.remove(&interface);
        debug!("Released interface {} on device {}", interface, self);
        Ok(())
    }

    /// Release every claimed interface, lowest number first
    ///
    /// All interfaces are attempted; the first failure is returned and the
    /// failed interfaces stay claimed.
    pub fn release_all_interfaces(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let DeviceState { handle, claimed } = &mut *state;
        let Some(handle) = handle.as_ref() else {
            return Ok(());
        };

        let mut first_error = None;
        for interface in claimed.clone() {
            match self.backend().release_interface(handle, interface) {
                Ok(()) => {
                    claimed.remove(&interface);
                    debug!("Released interface {} on device {}", interface, self);
                }
                Err(source) => {
                    warn!("Failed to release interface {} on {}: {}", interface, self, source);
                    first_error.get_or_insert(Error::Interface { interface, source });
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.inner.state.borrow().claimed.contains(&interface)
    }

    /// Claimed interface numbers in ascending order
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.inner.state.borrow().claimed.iter().copied().collect()
    }

    /// Borrow the open handle, if any
    pub(crate) fn handle(&self) -> Option<Ref<'_, B::Handle>> {
        Ref::filter_map(self.inner.state.borrow(), |state| state.handle.as_ref()).ok()
    }

    fn backend(&self) -> &B {
        self.inner.session.backend()
    }
}

impl<B: Backend> DeviceInner<B> {
    fn close(&self) {
        let mut state = self.state.borrow_mut();
        let Some(handle) = state.handle.take() else {
            return;
        };

        let backend = self.session.backend();
        for interface in std::mem::take(&mut state.claimed) {
            match backend.release_interface(&handle, interface) {
                Ok(()) => debug!("Released interface {} on device {}", interface, self.info),
                Err(e) => warn!(
                    "Failed to release interface {} on {}: {}",
                    interface, self.info, e
                ),
            }
        }

        backend.close(handle);
        debug!("Closed device {}", self.info);
    }
}

impl<B: Backend> Drop for DeviceInner<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: Backend> fmt::Display for Device<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.info, f)
    }
}

impl<B: Backend> fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Device")
            .field("info", &self.inner.info)
            .field("open", &state.handle.is_some())
            .field("claimed", &state.claimed)
            .finish()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}:{:03} ({:04x}:{:04x})",
            self.bus_number, self.address, self.vendor_id, self.product_id
        )
    }
}
