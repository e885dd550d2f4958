//! libusb backend
//!
//! Enumeration, open/close and interface claims go through rusb's safe API.
//! Asynchronous transfers are not covered by it, so they are driven through
//! the raw bindings in `rusb::ffi`: allocate, fill, submit, cancel, and
//! collect in the completion callback that libusb runs from inside
//! `handle_events`.

use crate::backend::{
    Backend, DeviceInfo, RawCompletion, Rejected, SETUP_PACKET_SIZE, TransferId, TransferKind,
    TransferRequest, TransferStatus,
};
use common::{DebugLevel, SessionSettings};
use rusb::constants::*;
use rusb::{Context, LogLevel, UsbContext, ffi};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long dropping the backend waits for cancelled transfers to come back
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Open libusb handle, shared with the transfers submitted through it
pub type LibusbHandle = Rc<RefCell<rusb::DeviceHandle<Context>>>;

/// Transfers reported finished by the callback, not yet collected
type FinishedQueue = RefCell<Vec<*mut ffi::libusb_transfer>>;

pub struct Libusb {
    pending: RefCell<Outstanding<NativeTransfer>>,
    /// Boxed so the address handed to libusb as `user_data` never moves
    finished: Box<FinishedQueue>,
    detach_kernel_driver: bool,
    context: Context,
}

impl Libusb {
    pub fn new(settings: &SessionSettings) -> rusb::Result<Self> {
        let mut context = Context::new()?;
        context.set_log_level(log_level(settings.debug_level));
        debug!("libusb {} initialized", version_string());

        Ok(Self {
            pending: RefCell::new(Outstanding::default()),
            finished: Box::new(RefCell::new(Vec::new())),
            detach_kernel_driver: settings.detach_kernel_driver,
            context,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn finished_ptr(&self) -> *mut c_void {
        &*self.finished as *const FinishedQueue as *mut c_void
    }

    /// Collect completions recorded by the callback
    fn drain_finished(&self) -> Vec<RawCompletion> {
        let finished = std::mem::take(&mut *self.finished.borrow_mut());
        let mut pending = self.pending.borrow_mut();

        finished
            .into_iter()
            .filter_map(|raw| {
                let (id, native) = pending.take_finished(raw)?;
                Some(native.complete(id))
            })
            .collect()
    }
}

impl Backend for Libusb {
    type Device = rusb::Device<Context>;
    type Handle = LibusbHandle;

    fn devices(&self) -> rusb::Result<Vec<Self::Device>> {
        Ok(self.context.devices()?.iter().collect())
    }

    fn device_info(&self, device: &Self::Device) -> rusb::Result<DeviceInfo> {
        let descriptor = device.device_descriptor()?;

        Ok(DeviceInfo {
            bus_number: device.bus_number(),
            address: device.address(),
            port_number: device.port_number(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            class: descriptor.class_code(),
            subclass: descriptor.sub_class_code(),
            protocol: descriptor.protocol_code(),
            speed: device.speed(),
            num_configurations: descriptor.num_configurations(),
        })
    }

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle> {
        let mut handle = device.open()?;

        if self.detach_kernel_driver
            && let Err(e) = handle.set_auto_detach_kernel_driver(true)
        {
            debug!("Automatic kernel driver detach unavailable: {}", e);
        }

        Ok(Rc::new(RefCell::new(handle)))
    }

    fn close(&self, handle: Self::Handle) {
        let users = Rc::strong_count(&handle) - 1;
        if users > 0 {
            debug!("Handle stays open until {} transfers finish", users);
        }
    }

    fn claim_interface(&self, handle: &Self::Handle, interface: u8) -> rusb::Result<()> {
        handle.borrow_mut().claim_interface(interface)
    }

    fn release_interface(&self, handle: &Self::Handle, interface: u8) -> rusb::Result<()> {
        handle.borrow_mut().release_interface(interface)
    }

    fn submit(&self, handle: &Self::Handle, request: TransferRequest) -> Result<(), Rejected> {
        let TransferRequest {
            id,
            kind,
            timeout,
            buffer,
        } = request;

        let mut buffer = match kind {
            TransferKind::Control(setup) => {
                let Ok(length) = u16::try_from(buffer.len()) else {
                    return Err(Rejected {
                        error: rusb::Error::InvalidParam,
                        buffer,
                    });
                };
                let mut framed = Vec::with_capacity(SETUP_PACKET_SIZE + buffer.len());
                framed.extend_from_slice(&setup.packet(length));
                framed.extend_from_slice(&buffer);
                framed
            }
            TransferKind::Bulk { .. } => buffer,
        };

        let Ok(length) = c_int::try_from(buffer.len()) else {
            return Err(Rejected {
                error: rusb::Error::InvalidParam,
                buffer: strip_setup(kind, buffer),
            });
        };

        // SAFETY: plain allocation, checked for null below
        let Some(raw) = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }) else {
            return Err(Rejected {
                error: rusb::Error::NoMem,
                buffer: strip_setup(kind, buffer),
            });
        };

        // SAFETY: `raw` is a fresh transfer owned by us. The buffer and the
        // handle are kept alive by the NativeTransfer below until libusb hands
        // the transfer back through the callback.
        unsafe {
            let transfer = raw.as_ptr();
            (*transfer).dev_handle = handle.borrow().as_raw();
            (*transfer).endpoint = kind.endpoint();
            (*transfer).transfer_type = match kind {
                TransferKind::Control(_) => LIBUSB_TRANSFER_TYPE_CONTROL,
                TransferKind::Bulk { .. } => LIBUSB_TRANSFER_TYPE_BULK,
            };
            (*transfer).timeout = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);
            (*transfer).buffer = buffer.as_mut_ptr();
            (*transfer).length = length;
            (*transfer).callback = transfer_finished;
            (*transfer).user_data = self.finished_ptr();
        }

        let native = NativeTransfer {
            raw,
            buffer,
            kind,
            _handle: Rc::clone(handle),
        };

        // SAFETY: fully initialized above
        let rc = unsafe { ffi::libusb_submit_transfer(raw.as_ptr()) };
        if rc != LIBUSB_SUCCESS {
            return Err(Rejected {
                error: error_from_code(rc),
                buffer: native.into_buffer(),
            });
        }

        self.pending.borrow_mut().insert(id, raw.as_ptr(), native);
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> rusb::Result<()> {
        let pending = self.pending.borrow();
        let native = pending.get(&id).ok_or(rusb::Error::NotFound)?;

        // SAFETY: the transfer is in flight, so it has not been freed
        let rc = unsafe { ffi::libusb_cancel_transfer(native.raw.as_ptr()) };
        if rc == LIBUSB_SUCCESS {
            Ok(())
        } else {
            Err(error_from_code(rc))
        }
    }

    fn handle_events(&self, timeout: Option<Duration>) -> rusb::Result<Vec<RawCompletion>> {
        match self.context.handle_events(timeout) {
            // Callbacks that ran before an interruption are still collected
            Ok(()) | Err(rusb::Error::Interrupted) => {}
            Err(e) => return Err(e),
        }

        Ok(self.drain_finished())
    }
}

impl Drop for Libusb {
    fn drop(&mut self) {
        let outstanding = self.pending.get_mut().len();
        if outstanding == 0 {
            return;
        }

        warn!(
            "Cancelling {} outstanding transfers before closing the USB session",
            outstanding
        );
        for native in self.pending.get_mut().values() {
            // SAFETY: still in flight
            unsafe {
                ffi::libusb_cancel_transfer(native.raw.as_ptr());
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.pending.get_mut().is_empty() && Instant::now() < deadline {
            if let Err(e) = self.handle_events(Some(Duration::from_millis(10))) {
                warn!("Error draining USB events: {}", e);
                break;
            }
        }

        for (id, native) in self.pending.get_mut().drain() {
            // libusb may still write into the buffer; leaking beats a use-after-free
            warn!("Transfer {:?} never finished, leaking it", id);
            std::mem::forget(native);
        }
    }
}

/// Submitted transfers, reachable by id (cancel) and by native pointer
/// (completion callback)
struct Outstanding<T> {
    by_id: HashMap<TransferId, T>,
    ids: HashMap<*mut ffi::libusb_transfer, TransferId>,
}

impl<T> Default for Outstanding<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            ids: HashMap::new(),
        }
    }
}

impl<T> Outstanding<T> {
    fn insert(&mut self, id: TransferId, raw: *mut ffi::libusb_transfer, value: T) {
        self.ids.insert(raw, id);
        self.by_id.insert(id, value);
    }

    fn get(&self, id: &TransferId) -> Option<&T> {
        self.by_id.get(id)
    }

    fn take_finished(&mut self, raw: *mut ffi::libusb_transfer) -> Option<(TransferId, T)> {
        let id = self.ids.remove(&raw)?;
        self.by_id.remove(&id).map(|value| (id, value))
    }

    fn values(&self) -> impl Iterator<Item = &T> {
        self.by_id.values()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }

    fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn drain(&mut self) -> impl Iterator<Item = (TransferId, T)> + '_ {
        self.ids.clear();
        self.by_id.drain()
    }
}

/// A submitted libusb transfer and everything it points into
struct NativeTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    buffer: Vec<u8>,
    kind: TransferKind,
    _handle: LibusbHandle,
}

impl NativeTransfer {
    fn complete(self, id: TransferId) -> RawCompletion {
        // SAFETY: the callback has run, libusb no longer touches the transfer
        let (status, actual_length) = unsafe {
            let transfer = self.raw.as_ptr();
            ((*transfer).status, (*transfer).actual_length)
        };

        RawCompletion {
            id,
            status: status_from_code(status),
            actual_length: usize::try_from(actual_length).unwrap_or(0),
            buffer: self.into_buffer(),
        }
    }

    /// Caller-visible part of the buffer
    fn into_buffer(mut self) -> Vec<u8> {
        let buffer = std::mem::take(&mut self.buffer);
        strip_setup(self.kind, buffer)
    }
}

impl Drop for NativeTransfer {
    fn drop(&mut self) {
        // SAFETY: only dropped once libusb is done with the transfer
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) }
    }
}

extern "system" fn transfer_finished(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: `user_data` is the owning backend's boxed queue, which outlives
    // every transfer submitted through it.
    let queue = unsafe { &*((*transfer).user_data as *const FinishedQueue) };
    // Only borrowed outside of libusb calls
    match queue.try_borrow_mut() {
        Ok(mut queue) => queue.push(transfer),
        Err(_) => warn!(
            "Completion queue busy, finished transfer {:p} will not be collected",
            transfer
        ),
    }
}

fn strip_setup(kind: TransferKind, mut buffer: Vec<u8>) -> Vec<u8> {
    if let TransferKind::Control(_) = kind {
        buffer.drain(..SETUP_PACKET_SIZE.min(buffer.len()));
    }
    buffer
}

fn log_level(level: DebugLevel) -> LogLevel {
    match level {
        DebugLevel::Off => LogLevel::None,
        DebugLevel::Level1 => LogLevel::Error,
        DebugLevel::Level2 => LogLevel::Warning,
        DebugLevel::Level3 => LogLevel::Info,
    }
}

fn version_string() -> String {
    let version = rusb::version();
    format!(
        "{}.{}.{}.{}",
        version.major(),
        version.minor(),
        version.micro(),
        version.nano()
    )
}

/// Map a libusb transfer status to the wrapper's status
fn status_from_code(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stalled,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        _ => TransferStatus::Error,
    }
}

/// Map a libusb error code to rusb's error type
fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
