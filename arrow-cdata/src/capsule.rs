//! Named containers used to hand a structure to a foreign holder.
//!
//! Whoever receives a capsule owns its payload: it either takes the
//! structure out or drops the capsule, which releases the payload.

use std::ffi::c_void;
use std::fmt;

use crate::array::ArrayHandle;
use crate::error::{Error, Result};
use crate::ffi::{ArrowArray, ArrowArrayStream, ArrowDeviceArray, ArrowSchema};
use crate::pointer::Releasable;
use crate::schema::SchemaHandle;
use crate::stream::StreamHandle;

/// A C structure that can travel in a [`Capsule`].
pub trait CapsulePayload: Releasable + 'static {
    const NAME: &'static str;
}

impl CapsulePayload for ArrowSchema {
    const NAME: &'static str = "arrow_schema";
}

impl CapsulePayload for ArrowArray {
    const NAME: &'static str = "arrow_array";
}

impl CapsulePayload for ArrowArrayStream {
    const NAME: &'static str = "arrow_array_stream";
}

impl CapsulePayload for ArrowDeviceArray {
    const NAME: &'static str = "arrow_device_array";
}

pub struct Capsule {
    name: &'static str,
    ptr: *mut c_void,
    destructor: unsafe fn(*mut c_void),
}

unsafe impl Send for Capsule {}

unsafe fn destroy<T: CapsulePayload>(ptr: *mut c_void) {
    let ptr = ptr as *mut T;
    T::release_in_place(ptr);
    drop(Box::from_raw(ptr));
}

impl Capsule {
    pub fn new<T: CapsulePayload>(payload: Box<T>) -> Self {
        Self {
            name: T::NAME,
            ptr: Box::into_raw(payload) as *mut c_void,
            destructor: destroy::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }

    fn check<T: CapsulePayload>(&self) -> Result<()> {
        if self.name != T::NAME {
            return Err(Error::CapsuleName {
                expected: T::NAME.to_string(),
                found: self.name.to_string(),
            });
        }
        if self.ptr.is_null() {
            return Err(Error::Released("capsule payload"));
        }
        Ok(())
    }

    /// Borrows the payload without taking ownership.
    pub fn get<T: CapsulePayload>(&self) -> Result<&T> {
        self.check::<T>()?;
        Ok(unsafe { &*(self.ptr as *const T) })
    }

    /// Takes the payload out; the capsule is left empty.
    ///
    /// A name mismatch leaves the payload in place.
    pub fn take<T: CapsulePayload>(&mut self) -> Result<Box<T>> {
        self.check::<T>()?;
        let payload = unsafe { Box::from_raw(self.ptr as *mut T) };
        self.ptr = std::ptr::null_mut();
        Ok(payload)
    }
}

impl Drop for Capsule {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.destructor)(self.ptr) };
            self.ptr = std::ptr::null_mut();
        }
    }
}

impl fmt::Debug for Capsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capsule")
            .field("name", &self.name)
            .field("empty", &self.is_empty())
            .finish()
    }
}

impl SchemaHandle {
    pub fn into_capsule(self) -> Capsule {
        Capsule::new(unsafe { Box::from_raw(self.into_raw()) })
    }

    pub fn from_capsule(capsule: &mut Capsule) -> Result<Self> {
        let mut raw = capsule.take::<ArrowSchema>()?;
        unsafe { Self::from_raw(&mut *raw) }
    }
}

impl ArrayHandle {
    pub fn into_capsule(self) -> Capsule {
        Capsule::new(unsafe { Box::from_raw(self.into_raw()) })
    }

    pub fn from_capsule(capsule: &mut Capsule) -> Result<Self> {
        let mut raw = capsule.take::<ArrowArray>()?;
        unsafe { Self::from_raw(&mut *raw) }
    }
}

impl StreamHandle {
    pub fn into_capsule(self) -> Capsule {
        Capsule::new(unsafe { Box::from_raw(self.into_raw()) })
    }

    pub fn from_capsule(capsule: &mut Capsule) -> Result<Self> {
        let mut raw = capsule.take::<ArrowArrayStream>()?;
        unsafe { Self::from_raw(&mut *raw) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayData;
    use crate::schema::Schema;

    #[test]
    fn schema_round_trip() {
        let handle = SchemaHandle::new(Schema::new("i").with_name("x")).unwrap();
        let mut capsule = handle.into_capsule();
        assert_eq!(capsule.name(), "arrow_schema");
        assert_eq!(capsule.get::<ArrowSchema>().unwrap().n_children, 0);
        let back = SchemaHandle::from_capsule(&mut capsule).unwrap();
        assert_eq!(back.view().unwrap().name(), Some("x"));
        assert!(capsule.is_empty());
    }

    fn through_capsule(schema: &Schema) -> Schema {
        let mut capsule = SchemaHandle::new(schema.clone()).unwrap().into_capsule();
        let back = SchemaHandle::from_capsule(&mut capsule).unwrap();
        assert!(capsule.is_empty());
        back.to_schema().unwrap()
    }

    #[test]
    fn nested_schema_round_trip() {
        let list = Schema::new("+l")
            .with_name("scores")
            .with_children(vec![Schema::new("i").with_name("item")]);
        let back = through_capsule(&list);
        assert_eq!(back.format(), "+l");
        assert_eq!(back.name(), Some("scores"));
        assert_eq!(back.children().len(), 1);
        assert_eq!(back.children()[0].format(), "i");
        assert_eq!(back.children()[0].name(), Some("item"));
        assert_eq!(back, list);

        let dict = Schema::new("c")
            .with_name("color")
            .with_dictionary(Schema::new("u"));
        let back = through_capsule(&dict);
        assert_eq!(back.name(), Some("color"));
        assert_eq!(back.dictionary().map(Schema::format), Some("u"));
        assert_eq!(back, dict);
    }

    #[test]
    fn wrong_name_keeps_payload() {
        let handle = ArrayHandle::new(ArrayData::from_values(&[1i32])).unwrap();
        let mut capsule = handle.into_capsule();
        let err = SchemaHandle::from_capsule(&mut capsule).unwrap_err();
        assert!(matches!(err, Error::CapsuleName { .. }));
        assert!(!capsule.is_empty());
        assert!(ArrayHandle::from_capsule(&mut capsule).is_ok());
    }

    #[test]
    fn dropping_capsule_releases_payload() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let handle = ArrayHandle::new(ArrayData::from_values(&[1u8]))
            .unwrap()
            .with_keep_alive(Flag(dropped.clone()));
        let capsule = handle.into_capsule();
        assert!(!dropped.load(Ordering::SeqCst));
        drop(capsule);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn taken_capsule_reports_empty() {
        let mut capsule = SchemaHandle::new(Schema::new("u")).unwrap().into_capsule();
        let mut raw = capsule.take::<ArrowSchema>().unwrap();
        unsafe { ArrowSchema::release_in_place(&mut *raw) };
        assert!(matches!(capsule.get::<ArrowSchema>(), Err(Error::Released(_))));
    }
}
