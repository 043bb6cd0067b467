//! Raw `#[repr(C)]` structures of the Arrow C data, C stream and C device
//! interfaces.
//!
//! These are bit-for-bit the structures other runtimes expect; everything in
//! this crate that owns one of them goes through the handle types in
//! [`crate::schema`], [`crate::array`] and [`crate::stream`].

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

/// `ArrowSchema.flags`: dictionary indices are ordered.
pub const FLAG_DICTIONARY_ORDERED: i64 = 1;
/// `ArrowSchema.flags`: the field may contain nulls.
pub const FLAG_NULLABLE: i64 = 2;
/// `ArrowSchema.flags`: map keys are sorted.
pub const FLAG_MAP_KEYS_SORTED: i64 = 4;

#[repr(C)]
#[derive(Debug)]
pub struct ArrowSchema {
    pub format: *const c_char,
    pub name: *const c_char,
    pub metadata: *const c_char,
    pub flags: i64,
    pub n_children: i64,
    pub children: *mut *mut ArrowSchema,
    pub dictionary: *mut ArrowSchema,
    pub release: Option<unsafe extern "C" fn(*mut ArrowSchema)>,
    pub private_data: *mut c_void,
}

impl ArrowSchema {
    /// A released (moved-from) schema, suitable as an output slot.
    pub const fn empty() -> Self {
        Self {
            format: ptr::null(),
            name: ptr::null(),
            metadata: ptr::null(),
            flags: 0,
            n_children: 0,
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct ArrowArray {
    pub length: i64,
    pub null_count: i64,
    pub offset: i64,
    pub n_buffers: i64,
    pub n_children: i64,
    pub buffers: *mut *const c_void,
    pub children: *mut *mut ArrowArray,
    pub dictionary: *mut ArrowArray,
    pub release: Option<unsafe extern "C" fn(*mut ArrowArray)>,
    pub private_data: *mut c_void,
}

impl ArrowArray {
    /// A released array. Also the end-of-stream marker of `get_next`.
    pub const fn empty() -> Self {
        Self {
            length: 0,
            null_count: 0,
            offset: 0,
            n_buffers: 0,
            n_children: 0,
            buffers: ptr::null_mut(),
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct ArrowArrayStream {
    pub get_schema:
        Option<unsafe extern "C" fn(stream: *mut ArrowArrayStream, out: *mut ArrowSchema) -> c_int>,
    pub get_next:
        Option<unsafe extern "C" fn(stream: *mut ArrowArrayStream, out: *mut ArrowArray) -> c_int>,
    pub get_last_error:
        Option<unsafe extern "C" fn(stream: *mut ArrowArrayStream) -> *const c_char>,
    pub release: Option<unsafe extern "C" fn(stream: *mut ArrowArrayStream)>,
    pub private_data: *mut c_void,
}

impl ArrowArrayStream {
    pub const fn empty() -> Self {
        Self {
            get_schema: None,
            get_next: None,
            get_last_error: None,
            release: None,
            private_data: ptr::null_mut(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

/// `ArrowDeviceArray` of the C device data interface.
#[repr(C)]
#[derive(Debug)]
pub struct ArrowDeviceArray {
    pub array: ArrowArray,
    pub device_id: i64,
    pub device_type: i32,
    pub sync_event: *mut c_void,
    /// Reserved for future use; must be zeroed.
    pub reserved: [i64; 3],
}

impl ArrowDeviceArray {
    pub const fn empty() -> Self {
        Self {
            array: ArrowArray::empty(),
            device_id: -1,
            device_type: 0,
            sync_event: ptr::null_mut(),
            reserved: [0; 3],
        }
    }

    pub fn is_released(&self) -> bool {
        self.array.is_released()
    }
}

/// Calls `schema.release` if the schema is still live.
///
/// # Safety
/// `schema` must be null or point to a valid `ArrowSchema`.
pub unsafe fn release_schema_in_place(schema: *mut ArrowSchema) {
    if schema.is_null() {
        return;
    }
    if let Some(release) = (*schema).release {
        release(schema);
        debug_assert!((*schema).release.is_none(), "release callback left schema live");
    }
}

/// Calls `array.release` if the array is still live.
///
/// # Safety
/// `array` must be null or point to a valid `ArrowArray`.
pub unsafe fn release_array_in_place(array: *mut ArrowArray) {
    if array.is_null() {
        return;
    }
    if let Some(release) = (*array).release {
        release(array);
        debug_assert!((*array).release.is_none(), "release callback left array live");
    }
}

/// Calls `stream.release` if the stream is still live.
///
/// # Safety
/// `stream` must be null or point to a valid `ArrowArrayStream`.
pub unsafe fn release_stream_in_place(stream: *mut ArrowArrayStream) {
    if stream.is_null() {
        return;
    }
    if let Some(release) = (*stream).release {
        release(stream);
    }
}
