//! Reference-counted raw buffers backing exported arrays.

use std::any::Any;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::Arc;

use crate::error::{Error, Result};

type Owner = Arc<dyn Any + Send + Sync>;

/// A contiguous region of memory and whatever keeps it alive.
///
/// The pointer may address host memory or memory on an accelerator; only host
/// buffers can be viewed as slices. Cloning shares the owner, which is the
/// only way a buffer ends up referenced by more than one live array.
#[derive(Clone)]
pub struct Buffer {
    ptr: *const u8,
    len: usize,
    host: bool,
    owner: Option<Owner>,
}

// The owner is Send + Sync and the pointer is never written through.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// An absent buffer (e.g. no validity bitmap). Exported as a null pointer.
    pub const fn null() -> Self {
        Self {
            ptr: ptr::null(),
            len: 0,
            host: true,
            owner: None,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let ptr = data.as_ptr();
        let len = data.len();
        Self {
            ptr,
            len,
            host: true,
            owner: Some(Arc::new(data)),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Copies typed values into a new little-endian host buffer.
    pub fn from_values<T: ToLeBytes>(values: &[T]) -> Self {
        let mut data = Vec::with_capacity(std::mem::size_of_val(values));
        for v in values {
            v.extend_le(&mut data);
        }
        Self::from_vec(data)
    }

    /// Shares an arrow-rs buffer without copying.
    pub fn from_arrow(buffer: arrow_buffer::Buffer) -> Self {
        let ptr = buffer.as_ptr();
        let len = buffer.len();
        Self {
            ptr,
            len,
            host: true,
            owner: Some(Arc::new(buffer)),
        }
    }

    /// Wraps host memory kept alive by `owner`.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay valid and unmodified for as long as `owner`
    /// is alive.
    pub unsafe fn from_owner<O: Any + Send + Sync>(ptr: *const u8, len: usize, owner: O) -> Self {
        Self {
            ptr,
            len,
            host: true,
            owner: Some(Arc::new(owner)),
        }
    }

    /// Wraps device memory freed when `owner` drops.
    ///
    /// # Safety
    /// `ptr` must be a device address of at least `len` bytes owned by `owner`.
    pub unsafe fn from_device_owner<O: Any + Send + Sync>(
        ptr: *const u8,
        len: usize,
        owner: O,
    ) -> Self {
        Self {
            ptr,
            len,
            host: false,
            owner: Some(Arc::new(owner)),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    /// The buffer contents, for host buffers only.
    pub fn as_slice(&self) -> Option<&[u8]> {
        if !self.host {
            return None;
        }
        if self.ptr.is_null() || self.len == 0 {
            return Some(&[]);
        }
        // Host buffers are valid for `len` bytes while the owner lives.
        Some(unsafe { slice::from_raw_parts(self.ptr, self.len) })
    }

    /// Number of buffers (this one included) sharing the same owner.
    pub fn strong_count(&self) -> usize {
        self.owner.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    /// Appends bytes to a host buffer, copying into a fresh allocation so
    /// other holders of the old contents are unaffected.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let current = self
            .as_slice()
            .ok_or_else(|| Error::InvalidArgument("cannot append to a device buffer".into()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(current.len() + bytes.len())
            .map_err(|_| Error::OutOfMemory {
                device: "cpu:0".into(),
                requested: current.len() + bytes.len(),
            })?;
        data.extend_from_slice(current);
        data.extend_from_slice(bytes);
        *self = Buffer::from_vec(data);
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("host", &self.host)
            .finish()
    }
}

/// Primitive values that can be laid out in an Arrow fixed-width buffer.
pub trait ToLeBytes: Copy {
    fn extend_le(&self, out: &mut Vec<u8>);
}

macro_rules! impl_to_le_bytes {
    ($($t:ty),*) => {
        $(impl ToLeBytes for $t {
            fn extend_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_to_le_bytes!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

/// Packs booleans into an LSB-first bitmap.
pub fn pack_bits(bits: impl IntoIterator<Item = bool>) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, bit) in bits.into_iter().enumerate() {
        if i % 8 == 0 {
            out.push(0u8);
        }
        if bit {
            let last = out.len() - 1;
            out[last] |= 1 << (i % 8);
        }
    }
    out
}
