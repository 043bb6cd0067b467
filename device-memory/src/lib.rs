//! Devices, device arrays and cross-device copies for the Arrow C device
//! interface.

pub mod copy;
pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod device_array;
pub mod event;
pub mod simulated;
pub mod transfer_queue;

pub use copy::copy_device_array;
pub use cpu::{cpu, CpuDevice};
#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;
pub use device::{buffer_init, BufferSource, Device, DeviceId, DeviceRef, DeviceType};
pub use device_array::{array_init, DeviceArray};
pub use event::SyncEvent;
pub use simulated::SimulatedDevice;
pub use transfer_queue::{TransferDirection, TransferQueue};
