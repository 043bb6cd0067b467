//! A host-memory stand-in for an accelerator.
//!
//! Buffers are tagged as device memory so nothing treats them as host
//! slices, allocations are counted, and both allocation and copy failures
//! can be injected to exercise rollback paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arrow_cdata::{Buffer, Error, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::{BufferSource, Device, DeviceId, DeviceType};
use crate::event::SyncEvent;

/// Error code reported for injected copy failures.
pub const SIMULATED_COPY_FAILURE: i32 = 999;

#[derive(Debug, Default)]
struct Accounting {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// Decrements the live counters when the owning buffer drops.
struct Allocation {
    data: Vec<u8>,
    size: usize,
    accounting: Arc<Accounting>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.accounting.live_buffers.fetch_sub(1, Ordering::SeqCst);
        self.accounting.live_bytes.fetch_sub(self.size, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Allocations left before the next one fails.
    allocs_left: Option<usize>,
    copies_left: Option<usize>,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    id: i64,
    capacity: Option<usize>,
    latency: Option<Duration>,
    accounting: Arc<Accounting>,
    faults: Mutex<Faults>,
}

impl SimulatedDevice {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            capacity: None,
            latency: None,
            accounting: Arc::new(Accounting::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fails allocations that would push live bytes past `capacity`.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Events recorded on this device complete `latency` after recording.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The allocation after the next `n` succeed fails with out-of-memory.
    pub fn fail_allocs_after(&self, n: usize) {
        self.faults.lock().allocs_left = Some(n);
    }

    /// The copy after the next `n` succeed fails with a device error.
    pub fn fail_copies_after(&self, n: usize) {
        self.faults.lock().copies_left = Some(n);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn live_buffers(&self) -> usize {
        self.accounting.live_buffers.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.accounting.live_bytes.load(Ordering::SeqCst)
    }

    fn out_of_memory(&self, requested: usize) -> Error {
        Error::OutOfMemory {
            device: self.id().to_string(),
            requested,
        }
    }

    fn allocate(&self, size: usize) -> Result<Allocation> {
        {
            let mut faults = self.faults.lock();
            if let Some(left) = faults.allocs_left.as_mut() {
                if *left == 0 {
                    warn!(device = %self.id(), size, "injected allocation failure");
                    return Err(self.out_of_memory(size));
                }
                *left -= 1;
            }
        }
        if let Some(capacity) = self.capacity {
            if self.live_bytes() + size > capacity {
                return Err(self.out_of_memory(size));
            }
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| self.out_of_memory(size))?;
        data.resize(size, 0);
        self.accounting.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.accounting.live_bytes.fetch_add(size, Ordering::SeqCst);
        Ok(Allocation {
            data,
            size,
            accounting: self.accounting.clone(),
        })
    }

    fn wrap(allocation: Allocation) -> Buffer {
        let ptr = allocation.data.as_ptr();
        let len = allocation.data.len();
        // The heap block does not move when the allocation moves into the owner.
        unsafe { Buffer::from_device_owner(ptr, len, allocation) }
    }

    fn check_copy(&self) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Some(left) = faults.copies_left.as_mut() {
            if *left == 0 {
                warn!(device = %self.id(), "injected copy failure");
                return Err(Error::Device {
                    device: self.id().to_string(),
                    code: SIMULATED_COPY_FAILURE,
                    message: "injected copy failure".into(),
                });
            }
            *left -= 1;
        }
        Ok(())
    }
}

impl Device for SimulatedDevice {
    fn id(&self) -> DeviceId {
        DeviceId::new(DeviceType::ExtDev, self.id)
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        Ok(Self::wrap(self.allocate(size)?))
    }

    fn copy_from(&self, src: BufferSource<'_>) -> Result<Buffer> {
        let src_id = src.device.id();
        let direct = src_id == self.id() || src_id.device_type.is_host_accessible();
        if !direct {
            return Err(Error::UnsupportedTransfer {
                src: src_id.to_string(),
                dst: self.id().to_string(),
            });
        }
        self.check_copy()?;
        let mut allocation = self.allocate(src.len)?;
        // Both sides are plain host memory underneath.
        allocation.data.copy_from_slice(unsafe { src.as_host_slice() });
        debug!(src = %src_id, dst = %self.id(), bytes = src.len, "simulated copy");
        Ok(Self::wrap(allocation))
    }

    fn read_to_host(&self, src: *const u8, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if src.is_null() {
            return Err(Error::InvalidArgument("read from a null device pointer".into()));
        }
        self.check_copy()?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn record_event(&self) -> Result<SyncEvent> {
        let Some(latency) = self.latency else {
            return Ok(SyncEvent::completed());
        };
        let event = SyncEvent::pending();
        let signaller = event.clone();
        thread::Builder::new()
            .name(format!("sim-event-{}", self.id))
            .spawn(move || {
                thread::sleep(latency);
                signaller.signal();
            })
            .map_err(|e| Error::Device {
                device: self.id().to_string(),
                code: e.raw_os_error().unwrap_or(-1),
                message: format!("failed to spawn event thread: {e}"),
            })?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cpu;
    use crate::device::buffer_init;

    #[test]
    fn allocations_are_accounted() {
        let dev = SimulatedDevice::new(0);
        let a = dev.alloc(8).unwrap();
        let b = dev.alloc(4).unwrap();
        assert!(!a.is_host());
        assert_eq!(dev.live_buffers(), 2);
        assert_eq!(dev.live_bytes(), 12);
        drop(a);
        assert_eq!(dev.live_buffers(), 1);
        drop(b);
        assert_eq!(dev.live_bytes(), 0);
    }

    #[test]
    fn injected_allocation_failure() {
        let dev = SimulatedDevice::new(0);
        dev.fail_allocs_after(1);
        let _first = dev.alloc(1).unwrap();
        let err = dev.alloc(1).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        dev.clear_faults();
        assert!(dev.alloc(1).is_ok());
    }

    #[test]
    fn capacity_limit() {
        let dev = SimulatedDevice::new(0).with_capacity(10);
        let _a = dev.alloc(8).unwrap();
        assert!(dev.alloc(4).is_err());
    }

    #[test]
    fn host_round_trip_between_devices() {
        let host = cpu();
        let a = SimulatedDevice::new(0);
        let b = SimulatedDevice::new(1);
        let data = [9u8, 8, 7];
        let on_a =
            buffer_init(&a, 3, Some(BufferSource::new(host.as_ref(), data.as_ptr(), 3))).unwrap();
        // a -> b has no direct path.
        let direct = b.copy_from(BufferSource::new(&a, on_a.as_ptr(), 3));
        assert!(direct.unwrap_err().is_unsupported_transfer());
        let on_b = buffer_init(&b, 3, Some(BufferSource::new(&a, on_a.as_ptr(), 3))).unwrap();
        let back =
            buffer_init(host.as_ref(), 3, Some(BufferSource::new(&b, on_b.as_ptr(), 3))).unwrap();
        assert_eq!(back.as_slice().unwrap(), &data);
        assert_eq!(b.live_buffers(), 1);
    }

    #[test]
    fn latency_delays_event() {
        let dev = SimulatedDevice::new(0).with_latency(Duration::from_millis(20));
        let event = dev.record_event().unwrap();
        dev.synchronize(Some(&event)).unwrap();
        assert!(event.is_complete());
    }

    #[test]
    fn injected_copy_failure_is_device_error() {
        let host = cpu();
        let dev = SimulatedDevice::new(3);
        dev.fail_copies_after(0);
        let data = [1u8];
        let src = BufferSource::new(host.as_ref(), data.as_ptr(), 1);
        let err = buffer_init(&dev, 1, Some(src)).unwrap_err();
        assert!(matches!(err, Error::Device { code: SIMULATED_COPY_FAILURE, .. }));
        assert_eq!(dev.live_buffers(), 0);
    }
}
