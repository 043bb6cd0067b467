use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_cdata::{ArrayHandle, Schema, SchemaHandle, StreamHandle};
use device_memory::{DeviceArray, DeviceRef, TransferQueue};
use tracing::info;

pub mod config;
pub mod convert;
pub mod error;
pub mod lazy;
pub mod registry;
pub mod release_worker;

pub use config::BridgeConfig;
pub use convert::{Converter, HostConverter, HostVector};
pub use error::InteropError;
pub use lazy::{LazySource, LazyVector, PathStep};
pub use registry::{PreservationRegistry, Preserved, ReleaseOutcome, Token};
pub use release_worker::ReleaseWorkers;

/// Host-facing entry point: one registry, one transfer queue, one config.
pub struct Bridge {
    config: BridgeConfig,
    registry: PreservationRegistry,
    transfers: TransferQueue,
}

impl Bridge {
    /// Builds a bridge owned by the calling thread.
    pub fn new(config: BridgeConfig) -> Self {
        let registry =
            PreservationRegistry::new(config.release_workers, config.release_thread_name.clone());
        let transfers = TransferQueue::new(config.max_transfers_in_flight);
        info!(
            release_workers = config.release_workers,
            max_transfers = config.max_transfers_in_flight,
            "bridge started"
        );
        Self {
            config,
            registry,
            transfers,
        }
    }

    pub fn from_env() -> Result<Self> {
        let config = BridgeConfig::from_env().context("Invalid bridge configuration")?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PreservationRegistry {
        &self.registry
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfers
    }

    /// Streams `arrays`, validated against `schema` as configured.
    pub fn export_stream(&self, schema: Schema, arrays: Vec<ArrayHandle>) -> Result<StreamHandle> {
        StreamHandle::new(schema, arrays.into_iter().map(Ok), self.config.validate_streams)
            .context("Failed to export array stream")
    }

    /// Copies `array` to `dst` through the transfer queue.
    pub async fn copy_to_device(
        &self,
        array: Arc<DeviceArray>,
        schema: Arc<SchemaHandle>,
        dst: DeviceRef,
    ) -> Result<DeviceArray> {
        self.transfers.enqueue_copy(array, schema, dst).await
    }

    /// Wraps a host array for conversion on first access.
    pub fn lazy(&self, array: ArrayHandle, schema: SchemaHandle) -> Result<LazyVector> {
        LazyVector::new(array, schema).context("Failed to wrap array for lazy materialization")
    }

    /// Keeps `array` alive in the registry; dropping the guard releases it
    /// on a worker thread.
    pub fn preserve_array(&self, array: ArrayHandle) -> Result<Preserved> {
        self.registry
            .preserve_and_release_on_other_thread(array)
            .context("Failed to preserve array")
    }

    /// Stops accepting transfers and drains the registry. Returns the
    /// number of entries that were still preserved.
    pub fn shutdown(&self) -> usize {
        self.transfers.close();
        let leaked = self.registry.shutdown();
        info!(leaked, "bridge shut down");
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_cdata::ArrayData;
    use device_memory::{array_init, cpu, SimulatedDevice};

    fn int32s(values: &[i32]) -> ArrayHandle {
        ArrayHandle::new(ArrayData::from_values(values)).unwrap()
    }

    #[test]
    fn stream_validation_follows_config() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut stream = bridge
            .export_stream(Schema::new("+s"), vec![int32s(&[1])])
            .unwrap();
        assert!(stream.next_array().is_err());
        assert!(stream.last_error().is_some());

        let lax = Bridge::new(BridgeConfig {
            validate_streams: false,
            ..BridgeConfig::default()
        });
        let mut stream = lax.export_stream(Schema::new("i"), vec![int32s(&[1, 2])]).unwrap();
        assert_eq!(stream.next_array().unwrap().unwrap().length(), 2);
        assert!(stream.next_array().unwrap().is_none());
    }

    #[test]
    fn preserved_arrays_are_released_on_workers() {
        let bridge = Bridge::new(BridgeConfig::default());
        let guard = bridge.preserve_array(int32s(&[1, 2, 3])).unwrap();
        assert_eq!(bridge.registry().preserved_count(), 1);
        drop(guard);
        bridge.registry().wait_for_workers();
        assert_eq!(bridge.registry().preserved_count(), 0);
        assert_eq!(bridge.shutdown(), 0);
    }

    #[tokio::test]
    async fn copies_go_through_the_queue() {
        let bridge = Bridge::new(BridgeConfig::default());
        let schema = Arc::new(SchemaHandle::new(Schema::new("i")).unwrap());
        let src = Arc::new(array_init(cpu(), int32s(&[5, 6]), None));
        let device: DeviceRef = Arc::new(SimulatedDevice::new(3));
        let copied = bridge
            .copy_to_device(src, schema.clone(), device.clone())
            .await
            .unwrap();
        assert_eq!(copied.device_id(), device.id());
        assert_eq!(bridge.transfers().issued(), 1);

        let back = bridge.copy_to_device(Arc::new(copied), schema, cpu()).await.unwrap();
        let host = LazyVector::from_device_array(back, SchemaHandle::new(Schema::new("i")).unwrap())
            .unwrap();
        assert_eq!(*host.value().unwrap(), HostVector::Int(vec![Some(5), Some(6)]));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_copies() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.shutdown();
        let schema = Arc::new(SchemaHandle::new(Schema::new("i")).unwrap());
        let src = Arc::new(array_init(cpu(), int32s(&[1]), None));
        assert!(bridge.copy_to_device(src, schema, cpu()).await.is_err());
    }
}
