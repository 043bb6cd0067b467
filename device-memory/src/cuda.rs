//! CUDA device memory through `cudarc`.

use std::sync::Arc;

use arrow_cdata::{Buffer, Error, Result};
use cudarc::driver::{result as cu, CudaDevice as CudarcDevice, CudaSlice, DevicePtr, DriverError};
use tracing::{debug, info};

use crate::device::{BufferSource, Device, DeviceId, DeviceType};
use crate::event::SyncEvent;

/// One CUDA device. Copies use the synchronous driver calls, so recorded
/// events are complete when returned.
#[derive(Debug)]
pub struct CudaDevice {
    ordinal: usize,
    device: Arc<CudarcDevice>,
}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudarcDevice::new(ordinal).map_err(|e| driver_error(ordinal, e))?;
        info!(ordinal, name = ?device.name().ok(), "opened CUDA device");
        Ok(Self { ordinal, device })
    }

    pub fn inner(&self) -> &Arc<CudarcDevice> {
        &self.device
    }

    fn err(&self, e: DriverError) -> Error {
        driver_error(self.ordinal, e)
    }

    fn wrap(slice: CudaSlice<u8>, len: usize) -> Buffer {
        let ptr = *slice.device_ptr() as usize as *const u8;
        unsafe { Buffer::from_device_owner(ptr, len, slice) }
    }
}

fn driver_error(ordinal: usize, e: DriverError) -> Error {
    Error::Device {
        device: DeviceId::new(DeviceType::Cuda, ordinal as i64).to_string(),
        code: e.0 as i32,
        message: e.to_string(),
    }
}

impl Device for CudaDevice {
    fn id(&self) -> DeviceId {
        DeviceId::new(DeviceType::Cuda, self.ordinal as i64)
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        if size == 0 {
            return Ok(Buffer::null());
        }
        let slice = self.device.alloc_zeros::<u8>(size).map_err(|e| self.err(e))?;
        Ok(Self::wrap(slice, size))
    }

    fn copy_from(&self, src: BufferSource<'_>) -> Result<Buffer> {
        let src_id = src.device.id();
        if src.len == 0 {
            return Ok(Buffer::null());
        }
        if src_id.device_type.is_host_accessible() {
            let host = unsafe { src.as_host_slice() };
            let slice = self.device.htod_sync_copy(host).map_err(|e| self.err(e))?;
            debug!(bytes = src.len, "host to device copy");
            return Ok(Self::wrap(slice, src.len));
        }
        if src_id == self.id() {
            let slice = self.device.alloc_zeros::<u8>(src.len).map_err(|e| self.err(e))?;
            self.device.bind_to_thread().map_err(|e| self.err(e))?;
            unsafe { cu::memcpy_dtod_sync(*slice.device_ptr(), src.ptr as usize as u64, src.len) }
                .map_err(|e| self.err(e))?;
            debug!(bytes = src.len, "device to device copy");
            return Ok(Self::wrap(slice, src.len));
        }
        Err(Error::UnsupportedTransfer {
            src: src_id.to_string(),
            dst: self.id().to_string(),
        })
    }

    fn read_to_host(&self, src: *const u8, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.device.bind_to_thread().map_err(|e| self.err(e))?;
        unsafe { cu::memcpy_dtoh_sync(dst, src as usize as u64) }.map_err(|e| self.err(e))
    }

    fn record_event(&self) -> Result<SyncEvent> {
        Ok(SyncEvent::completed())
    }

    fn synchronize(&self, event: Option<&SyncEvent>) -> Result<()> {
        self.device.synchronize().map_err(|e| self.err(e))?;
        if let Some(event) = event {
            event.wait();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cpu;
    use crate::device::buffer_init;

    #[test]
    #[ignore = "requires a CUDA device"]
    fn host_device_round_trip() {
        let gpu = CudaDevice::new(0).unwrap();
        let host = cpu();
        let data = [1u8, 2, 3, 4];
        let on_gpu =
            buffer_init(&gpu, 4, Some(BufferSource::new(host.as_ref(), data.as_ptr(), 4))).unwrap();
        assert!(!on_gpu.is_host());
        let back =
            buffer_init(host.as_ref(), 4, Some(BufferSource::new(&gpu, on_gpu.as_ptr(), 4)))
                .unwrap();
        assert_eq!(back.as_slice().unwrap(), &data);
    }
}
