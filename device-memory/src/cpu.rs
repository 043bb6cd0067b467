use std::sync::{Arc, OnceLock};

use arrow_cdata::{Buffer, Error, Result};

use crate::device::{BufferSource, Device, DeviceId, DeviceRef};
use crate::event::SyncEvent;

/// Host memory. Copies are synchronous, so every event is already complete.
#[derive(Debug, Default)]
pub struct CpuDevice;

/// The process-wide CPU device.
pub fn cpu() -> DeviceRef {
    static CPU: OnceLock<DeviceRef> = OnceLock::new();
    CPU.get_or_init(|| Arc::new(CpuDevice)).clone()
}

fn host_vec(size: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| Error::OutOfMemory {
        device: DeviceId::CPU.to_string(),
        requested: size,
    })?;
    data.resize(size, 0);
    Ok(data)
}

impl Device for CpuDevice {
    fn id(&self) -> DeviceId {
        DeviceId::CPU
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        Ok(Buffer::from_vec(host_vec(size)?))
    }

    fn copy_from(&self, src: BufferSource<'_>) -> Result<Buffer> {
        if !src.device.id().device_type.is_host_accessible() {
            return Err(Error::UnsupportedTransfer {
                src: src.device.id().to_string(),
                dst: self.id().to_string(),
            });
        }
        let mut data = host_vec(src.len)?;
        data.copy_from_slice(unsafe { src.as_host_slice() });
        Ok(Buffer::from_vec(data))
    }

    fn read_to_host(&self, src: *const u8, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if src.is_null() {
            return Err(Error::InvalidArgument("read from a null host pointer".into()));
        }
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn record_event(&self) -> Result<SyncEvent> {
        Ok(SyncEvent::completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::buffer_init;

    #[test]
    fn alloc_is_zeroed() {
        let b = cpu().alloc(16).unwrap();
        assert_eq!(b.as_slice().unwrap(), &[0u8; 16]);
    }

    #[test]
    fn host_to_host_copy() {
        let data = [1u8, 2, 3, 4];
        let dev = cpu();
        let b = buffer_init(
            dev.as_ref(),
            3,
            Some(BufferSource::new(dev.as_ref(), data.as_ptr(), data.len())),
        )
        .unwrap();
        assert_eq!(b.as_slice().unwrap(), &[1, 2, 3]);
        assert_ne!(b.as_ptr(), data.as_ptr());
    }

    #[test]
    fn oversized_copy_rejected() {
        let data = [1u8];
        let dev = cpu();
        let src = BufferSource::new(dev.as_ref(), data.as_ptr(), 1);
        assert!(buffer_init(dev.as_ref(), 2, Some(src)).is_err());
    }
}
