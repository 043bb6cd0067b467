use std::fmt;
use std::ptr;

use arrow_cdata::{
    ArrayHandle, ArrayView, ArrowDeviceArray, Capsule, Error, Releasable, Result, SchemaHandle,
};

use crate::copy::copy_device_array;
use crate::device::{DeviceId, DeviceRef, DeviceType};
use crate::event::SyncEvent;

/// An array whose buffers live on `device`.
///
/// Buffers are only guaranteed readable after [`DeviceArray::synchronize`].
pub struct DeviceArray {
    raw: Box<ArrowDeviceArray>,
    device: DeviceRef,
    event: Option<SyncEvent>,
}

unsafe impl Send for DeviceArray {}
unsafe impl Sync for DeviceArray {}

/// Wraps `array`, whose buffers already live on `device`, without copying.
///
/// The event stays alive as long as the array does, so the `sync_event`
/// address handed to consumers remains valid after export.
pub fn array_init(device: DeviceRef, array: ArrayHandle, event: Option<SyncEvent>) -> DeviceArray {
    DeviceArray::new(device, array, event)
}

impl DeviceArray {
    pub fn new(device: DeviceRef, array: ArrayHandle, event: Option<SyncEvent>) -> Self {
        let mut array = match &event {
            Some(event) => array.with_keep_alive(event.clone()),
            None => array,
        };
        let id = device.id();
        let raw = Box::new(ArrowDeviceArray {
            array: array.take_raw(),
            device_id: id.id,
            device_type: id.device_type as i32,
            sync_event: event.as_ref().map_or(ptr::null_mut(), SyncEvent::as_raw),
            reserved: [0; 3],
        });
        Self { raw, device, event }
    }

    /// Takes ownership of a device array exported by this crate.
    ///
    /// A non-null `sync_event` is adopted as a [`SyncEvent`], so this only
    /// accepts arrays whose event slot was filled by [`DeviceArray::export_to`]
    /// or [`SyncEvent::as_raw`]. Arrays from other producers carry their own
    /// event type (a `cudaEvent_t*` on CUDA devices) and must go through
    /// [`DeviceArray::import_foreign`] instead.
    ///
    /// # Safety
    /// `src` must point to a valid `ArrowDeviceArray`. A non-null
    /// `sync_event` must have been produced by [`SyncEvent::as_raw`].
    pub unsafe fn import(src: *mut ArrowDeviceArray, device: DeviceRef) -> Result<Self> {
        Self::take_from(src, device, true)
    }

    /// Takes ownership of a device array from any producer without touching
    /// its `sync_event`.
    ///
    /// The imported array has no [`SyncEvent`]; the caller waits on the
    /// producer's event before reading the buffers.
    ///
    /// # Safety
    /// `src` must point to a valid `ArrowDeviceArray`.
    pub unsafe fn import_foreign(src: *mut ArrowDeviceArray, device: DeviceRef) -> Result<Self> {
        Self::take_from(src, device, false)
    }

    unsafe fn take_from(
        src: *mut ArrowDeviceArray,
        device: DeviceRef,
        adopt_event: bool,
    ) -> Result<Self> {
        if src.is_null() {
            return Err(Error::InvalidArgument("null device array pointer".into()));
        }
        if (*src).is_released() {
            return Err(Error::Released("device array"));
        }
        let tagged = DeviceId::new(DeviceType::try_from((*src).device_type)?, (*src).device_id);
        if tagged != device.id() {
            return Err(Error::InvalidArgument(format!(
                "array is tagged {tagged} but was imported for {}",
                device.id()
            )));
        }
        let raw = Box::new(arrow_cdata::pointer::take(src));
        let event = if raw.sync_event.is_null() || !adopt_event {
            None
        } else {
            Some(SyncEvent::from_raw(raw.sync_event))
        };
        Ok(Self { raw, device, event })
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn event(&self) -> Option<&SyncEvent> {
        self.event.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    pub fn release(&mut self) {
        unsafe { ArrowDeviceArray::release_in_place(&mut *self.raw) };
    }

    /// Structural view of the embedded array. Buffer addresses are device
    /// addresses.
    pub fn view(&self) -> Result<ArrayView<'_>> {
        if self.is_released() {
            return Err(Error::Released("device array"));
        }
        Ok(unsafe { ArrayView::new(&self.raw.array) })
    }

    pub fn length(&self) -> i64 {
        self.raw.array.length
    }

    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize(self.event.as_ref())
    }

    pub fn validate(&self, schema: &SchemaHandle) -> Result<()> {
        arrow_cdata::validate(self.view()?, schema.view()?)
    }

    /// Copies this array onto `dst`. See [`copy_device_array`].
    pub fn copy_to(&self, schema: &SchemaHandle, dst: &DeviceRef) -> Result<DeviceArray> {
        copy_device_array(self, schema, dst)
    }

    /// The embedded array, after synchronizing. Only meaningful to host
    /// readers when the device is host accessible.
    pub fn into_array(mut self) -> Result<ArrayHandle> {
        self.synchronize()?;
        unsafe { ArrayHandle::from_raw(&mut self.raw.array) }
    }

    /// # Safety
    /// `dst` must be valid for writes and must not hold a live structure.
    pub unsafe fn export_to(mut self, dst: *mut ArrowDeviceArray) {
        arrow_cdata::pointer::move_into(&mut *self.raw, dst);
    }

    pub fn into_capsule(mut self) -> Capsule {
        let raw = std::mem::replace(&mut self.raw, Box::new(ArrowDeviceArray::empty()));
        Capsule::new(raw)
    }

    /// # Safety
    /// Same contract as [`DeviceArray::import`].
    pub unsafe fn from_capsule(capsule: &mut Capsule, device: DeviceRef) -> Result<Self> {
        let mut raw = capsule.take::<ArrowDeviceArray>()?;
        Self::import(&mut *raw, device)
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DeviceArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceArray")
            .field("device", &self.device.id())
            .field("length", &self.raw.array.length)
            .field("released", &self.is_released())
            .finish()
    }
}
