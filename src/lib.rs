//! Arrow C data and device interfaces, cross-device copies and deferred
//! release, for bridging Arrow arrays between runtimes.
//!
//! * [`cdata`]: ABI structures, owning handles, validation and streams
//! * [`device`]: devices, device arrays and cross-device copy
//! * [`interop`]: preservation registry, lazy vectors and the [`Bridge`]

pub use arrow_cdata as cdata;
pub use device_memory as device;
pub use interop_core as interop;

pub use interop_core::{Bridge, BridgeConfig};

/// Version of the bridge, as built.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
