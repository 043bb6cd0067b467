use anyhow::{Context, Result};
use arrow_cdata::SchemaHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::copy::copy_device_array;
use crate::device::{DeviceId, DeviceRef, DeviceType};
use crate::device_array::DeviceArray;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl TransferDirection {
    pub fn between(src: DeviceId, dst: DeviceId) -> Self {
        let host = |id: DeviceId| id.device_type == DeviceType::Cpu;
        match (host(src), host(dst)) {
            (true, true) => TransferDirection::HostToHost,
            (true, false) => TransferDirection::HostToDevice,
            (false, true) => TransferDirection::DeviceToHost,
            (false, false) => TransferDirection::DeviceToDevice,
        }
    }
}

/// Bounds the number of device copies in flight.
///
/// Each copy runs on tokio's blocking pool since device copies block the
/// calling thread until the driver returns.
pub struct TransferQueue {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    issued: AtomicU64,
}

impl TransferQueue {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            issued: AtomicU64::new(0),
        }
    }

    /// Copy `array` onto `dst`, waiting for a free slot first.
    pub async fn enqueue_copy(
        &self,
        array: Arc<DeviceArray>,
        schema: Arc<SchemaHandle>,
        dst: DeviceRef,
    ) -> Result<DeviceArray> {
        // Acquire permit (waits if too many transfers in flight)
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("Transfer queue is closed")?;

        let seq = self.issued.fetch_add(1, Ordering::Relaxed);
        let src_id = array.device_id();
        let dst_id = dst.id();
        debug!(
            "{:?} transfer #{} from {} to {}",
            TransferDirection::between(src_id, dst_id),
            seq,
            src_id,
            dst_id
        );

        tokio::task::spawn_blocking(move || copy_device_array(&array, &schema, &dst))
            .await
            .context("Device copy task panicked")?
            .with_context(|| format!("Failed to copy array from {src_id} to {dst_id}"))
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Rejects queued and future copies; copies already running finish.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cpu;
    use crate::simulated::SimulatedDevice;
    use arrow_cdata::{ArrayData, ArrayHandle, Schema};
    use std::time::Duration;

    fn source() -> (Arc<DeviceArray>, Arc<SchemaHandle>) {
        let array = ArrayHandle::new(ArrayData::from_values(&[1i32, 2, 3])).unwrap();
        let schema = SchemaHandle::new(Schema::new("i")).unwrap();
        (Arc::new(DeviceArray::new(cpu(), array, None)), Arc::new(schema))
    }

    #[test]
    fn directions() {
        let sim = DeviceId::new(DeviceType::ExtDev, 0);
        assert_eq!(
            TransferDirection::between(DeviceId::CPU, sim),
            TransferDirection::HostToDevice
        );
        assert_eq!(
            TransferDirection::between(sim, sim),
            TransferDirection::DeviceToDevice
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn copies_run_concurrently_within_limit() {
        let queue = Arc::new(TransferQueue::new(2));
        let sim = Arc::new(SimulatedDevice::new(0).with_latency(Duration::from_millis(5)));
        let (array, schema) = source();

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let (array, schema) = (array.clone(), schema.clone());
            let dst: DeviceRef = sim.clone();
            tasks.push(tokio::spawn(async move {
                queue.enqueue_copy(array, schema, dst).await
            }));
        }
        for task in tasks {
            let copied = task.await.unwrap().unwrap();
            assert_eq!(copied.length(), 3);
        }
        assert_eq!(queue.issued(), 6);
        assert_eq!(queue.available(), 2);
        assert_eq!(sim.live_buffers(), 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects_copies() {
        let queue = TransferQueue::new(1);
        queue.close();
        let (array, schema) = source();
        let err = queue.enqueue_copy(array, schema, cpu()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn copy_errors_carry_context() {
        let queue = TransferQueue::new(1);
        let sim = Arc::new(SimulatedDevice::new(2));
        sim.fail_allocs_after(0);
        let (array, schema) = source();
        let err = queue.enqueue_copy(array, schema, sim).await.unwrap_err();
        assert!(format!("{err:#}").contains("out of memory"));
    }
}
