//! Move and address helpers shared by every released-by-callback structure.

use crate::ffi::{
    release_array_in_place, release_schema_in_place, release_stream_in_place, ArrowArray,
    ArrowArrayStream, ArrowDeviceArray, ArrowSchema,
};

/// A C structure whose lifetime ends with its own `release` callback.
pub trait Releasable: Sized {
    fn is_released(&self) -> bool;

    /// Nulls out `release` without calling it. Ownership has moved elsewhere.
    fn mark_released(&mut self);

    /// # Safety
    /// `ptr` must be null or point to a valid, possibly released, structure.
    unsafe fn release_in_place(ptr: *mut Self);
}

impl Releasable for ArrowSchema {
    fn is_released(&self) -> bool {
        self.release.is_none()
    }

    fn mark_released(&mut self) {
        self.release = None;
    }

    unsafe fn release_in_place(ptr: *mut Self) {
        release_schema_in_place(ptr)
    }
}

impl Releasable for ArrowArray {
    fn is_released(&self) -> bool {
        self.release.is_none()
    }

    fn mark_released(&mut self) {
        self.release = None;
    }

    unsafe fn release_in_place(ptr: *mut Self) {
        release_array_in_place(ptr)
    }
}

impl Releasable for ArrowArrayStream {
    fn is_released(&self) -> bool {
        self.release.is_none()
    }

    fn mark_released(&mut self) {
        self.release = None;
    }

    unsafe fn release_in_place(ptr: *mut Self) {
        release_stream_in_place(ptr)
    }
}

impl Releasable for ArrowDeviceArray {
    fn is_released(&self) -> bool {
        self.array.release.is_none()
    }

    fn mark_released(&mut self) {
        self.array.release = None;
    }

    unsafe fn release_in_place(ptr: *mut Self) {
        if !ptr.is_null() {
            release_array_in_place(&mut (*ptr).array)
        }
    }
}

/// Moves `src` into `dst`, leaving `src` released.
///
/// # Safety
/// Both pointers must be valid; `dst` must not hold a live structure.
pub unsafe fn move_into<T: Releasable>(src: *mut T, dst: *mut T) {
    std::ptr::copy_nonoverlapping(src, dst, 1);
    (*src).mark_released();
}

/// Moves the structure out of `src`, leaving `src` released.
///
/// # Safety
/// `src` must point to a valid structure.
pub unsafe fn take<T: Releasable>(src: *mut T) -> T {
    let out = std::ptr::read(src);
    (*src).mark_released();
    out
}

/// Integer address of a structure, for handing it to another runtime.
pub fn address_of<T>(ptr: *const T) -> usize {
    ptr as usize
}

/// # Safety
/// `addr` must have come from [`address_of`] on a live structure of type `T`.
pub unsafe fn from_address<T>(addr: usize) -> *mut T {
    addr as *mut T
}
