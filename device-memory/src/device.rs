//! Device identities and the trait every memory space implements.

use std::fmt;
use std::sync::Arc;

use arrow_cdata::{Buffer, Error, Result};
use tracing::debug;

use crate::event::SyncEvent;

/// Device type codes of the Arrow C device data interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceType {
    Cpu = 1,
    Cuda = 2,
    CudaHost = 3,
    OpenCl = 4,
    Vulkan = 7,
    Metal = 8,
    Vpi = 9,
    Rocm = 10,
    RocmHost = 11,
    ExtDev = 12,
    CudaManaged = 13,
    OneApi = 14,
    WebGpu = 15,
    Hexagon = 16,
}

impl DeviceType {
    /// Whether the host can dereference pointers into this memory space.
    pub fn is_host_accessible(self) -> bool {
        matches!(
            self,
            DeviceType::Cpu | DeviceType::CudaHost | DeviceType::RocmHost | DeviceType::CudaManaged
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::CudaHost => "cuda_host",
            DeviceType::OpenCl => "opencl",
            DeviceType::Vulkan => "vulkan",
            DeviceType::Metal => "metal",
            DeviceType::Vpi => "vpi",
            DeviceType::Rocm => "rocm",
            DeviceType::RocmHost => "rocm_host",
            DeviceType::ExtDev => "ext_dev",
            DeviceType::CudaManaged => "cuda_managed",
            DeviceType::OneApi => "oneapi",
            DeviceType::WebGpu => "webgpu",
            DeviceType::Hexagon => "hexagon",
        }
    }
}

impl TryFrom<i32> for DeviceType {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Ok(match code {
            1 => DeviceType::Cpu,
            2 => DeviceType::Cuda,
            3 => DeviceType::CudaHost,
            4 => DeviceType::OpenCl,
            7 => DeviceType::Vulkan,
            8 => DeviceType::Metal,
            9 => DeviceType::Vpi,
            10 => DeviceType::Rocm,
            11 => DeviceType::RocmHost,
            12 => DeviceType::ExtDev,
            13 => DeviceType::CudaManaged,
            14 => DeviceType::OneApi,
            15 => DeviceType::WebGpu,
            16 => DeviceType::Hexagon,
            other => {
                return Err(Error::InvalidArgument(format!("unknown device type code {other}")))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub device_type: DeviceType,
    pub id: i64,
}

impl DeviceId {
    pub const CPU: DeviceId = DeviceId {
        device_type: DeviceType::Cpu,
        id: 0,
    };

    pub fn new(device_type: DeviceType, id: i64) -> Self {
        Self { device_type, id }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type.name(), self.id)
    }
}

/// `len` bytes at `ptr`, living in `device`'s memory space.
#[derive(Clone, Copy)]
pub struct BufferSource<'a> {
    pub device: &'a dyn Device,
    pub ptr: *const u8,
    pub len: usize,
}

impl<'a> BufferSource<'a> {
    pub fn new(device: &'a dyn Device, ptr: *const u8, len: usize) -> Self {
        Self { device, ptr, len }
    }

    /// # Safety
    /// The source device must be host accessible and `ptr..ptr+len` readable.
    pub unsafe fn as_host_slice(&self) -> &'a [u8] {
        if self.len == 0 || self.ptr.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// A memory space that can hold array buffers.
pub trait Device: Send + Sync + fmt::Debug {
    fn id(&self) -> DeviceId;

    /// Allocates `size` zeroed bytes in this device's memory.
    fn alloc(&self, size: usize) -> Result<Buffer>;

    /// Allocates a buffer here and fills it from `src`.
    ///
    /// Returns [`Error::UnsupportedTransfer`] when this device has no direct
    /// path from the source device; [`buffer_init`] then goes through host
    /// memory.
    fn copy_from(&self, src: BufferSource<'_>) -> Result<Buffer>;

    /// Copies `dst.len()` bytes at `src` (device memory) into host memory.
    fn read_to_host(&self, src: *const u8, dst: &mut [u8]) -> Result<()>;

    /// An event that completes once all work issued so far is visible.
    fn record_event(&self) -> Result<SyncEvent>;

    /// Blocks until `event` (or all outstanding work when `None`) completes.
    fn synchronize(&self, event: Option<&SyncEvent>) -> Result<()> {
        if let Some(event) = event {
            event.wait();
        }
        Ok(())
    }
}

pub type DeviceRef = Arc<dyn Device>;

/// Allocates `size` bytes on `dst`, optionally filled from `src`.
///
/// Direct copies are tried first on the destination, then through host
/// memory when the two devices share no copy path.
pub fn buffer_init(dst: &dyn Device, size: usize, src: Option<BufferSource<'_>>) -> Result<Buffer> {
    let Some(src) = src else {
        return dst.alloc(size);
    };
    if src.len < size {
        return Err(Error::InvalidArgument(format!(
            "source holds {} bytes but {size} were requested",
            src.len
        )));
    }
    let src = BufferSource { len: size, ..src };
    match dst.copy_from(src) {
        Err(e) if e.is_unsupported_transfer() => {}
        other => return other,
    }

    debug!(src = %src.device.id(), dst = %dst.id(), size, "copying through host memory");
    let mut staging = Vec::new();
    staging.try_reserve_exact(size).map_err(|_| Error::OutOfMemory {
        device: DeviceId::CPU.to_string(),
        requested: size,
    })?;
    staging.resize(size, 0);
    src.device.read_to_host(src.ptr, &mut staging)?;
    if dst.id().device_type == DeviceType::Cpu {
        return Ok(Buffer::from_vec(staging));
    }
    let host = crate::cpu::cpu();
    dst.copy_from(BufferSource::new(host.as_ref(), staging.as_ptr(), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_codes_round_trip() {
        for code in [1, 2, 3, 4, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16] {
            let ty = DeviceType::try_from(code).unwrap();
            assert_eq!(ty as i32, code);
        }
        assert!(DeviceType::try_from(5).is_err());
        assert!(DeviceType::try_from(0).is_err());
    }

    #[test]
    fn device_id_display() {
        assert_eq!(DeviceId::CPU.to_string(), "cpu:0");
        assert_eq!(DeviceId::new(DeviceType::Cuda, 1).to_string(), "cuda:1");
    }

    #[test]
    fn host_accessibility() {
        assert!(DeviceType::Cpu.is_host_accessible());
        assert!(DeviceType::CudaHost.is_host_accessible());
        assert!(!DeviceType::Cuda.is_host_accessible());
        assert!(!DeviceType::ExtDev.is_host_accessible());
    }
}
