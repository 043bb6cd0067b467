//! Array descriptors: owned buffer-backed data, the exported C structure and
//! an owning handle that releases it exactly once.

use std::any::Any;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use arrow_array::Array as ArrowArrayTrait;
use arrow_buffer::NullBuffer;
use arrow_data::ArrayData as ArrowData;
use arrow_schema::DataType;
use tracing::warn;

use crate::buffer::{pack_bits, Buffer};
use crate::error::{Error, Result};
use crate::ffi::{release_array_in_place, ArrowArray};
use crate::layout::Layout;
use crate::schema::{Schema, SchemaHandle};
use crate::validate::validate;

/// Owned array contents, built before export.
#[derive(Debug, Clone, Default)]
pub struct ArrayData {
    length: i64,
    null_count: i64,
    offset: i64,
    buffers: Vec<Buffer>,
    children: Vec<ArrayData>,
    dictionary: Option<Box<ArrayData>>,
}

impl ArrayData {
    pub fn new(length: i64) -> Self {
        Self {
            length,
            ..Self::default()
        }
    }

    /// An empty array shaped after `schema`: null buffers in every slot the
    /// layout defines, and empty children and dictionary.
    pub fn empty_for(schema: &Schema) -> Result<Self> {
        let layout = Layout::for_type(&schema.data_type()?);
        Ok(Self {
            length: 0,
            null_count: 0,
            offset: 0,
            buffers: vec![Buffer::null(); layout.n_buffers()],
            children: schema
                .children()
                .iter()
                .map(ArrayData::empty_for)
                .collect::<Result<_>>()?,
            dictionary: schema
                .dictionary()
                .map(|d| ArrayData::empty_for(d).map(Box::new))
                .transpose()?,
        })
    }

    /// A fixed-width primitive array without nulls.
    pub fn from_values<T: crate::buffer::ToLeBytes>(values: &[T]) -> Self {
        Self::new(values.len() as i64)
            .with_buffers(vec![Buffer::null(), Buffer::from_values(values)])
    }

    /// Utf8 array (`u`) with nulls where `values` holds `None`.
    ///
    /// Fails when the concatenated values do not fit 32-bit offsets.
    pub fn from_strings<S: AsRef<str>>(values: &[Option<S>]) -> Result<Self> {
        let strs = || values.iter().map(|v| v.as_ref().map_or("", AsRef::as_ref));
        let offsets = utf8_offsets(strs().map(str::len))?;
        let data: Vec<u8> = strs().flat_map(str::bytes).collect();
        let null_count = values.iter().filter(|v| v.is_none()).count();
        let validity = if null_count > 0 {
            Buffer::from_vec(pack_bits(values.iter().map(Option::is_some)))
        } else {
            Buffer::null()
        };
        Ok(Self::new(values.len() as i64)
            .with_null_count(null_count as i64)
            .with_buffers(vec![validity, Buffer::from_values(&offsets), Buffer::from_vec(data)]))
    }

    /// Shares the buffers of an arrow-rs array without copying values.
    pub fn from_arrow(array: &dyn ArrowArrayTrait) -> Result<Self> {
        Self::from_arrow_data(&array.to_data())
    }

    fn from_arrow_data(data: &ArrowData) -> Result<Self> {
        let layout = arrow_data::layout(data.data_type());
        let mut buffers = Vec::with_capacity(data.buffers().len() + 1);
        if layout.can_contain_null_mask {
            buffers.push(validity_for(data.nulls(), data.offset(), data.len()));
        }
        buffers.extend(data.buffers().iter().cloned().map(Buffer::from_arrow));

        let (children, dictionary) = match data.data_type() {
            DataType::Dictionary(_, _) => {
                let values = data.child_data().first().ok_or_else(|| {
                    Error::InvalidArgument("dictionary array without values".into())
                })?;
                (Vec::new(), Some(Box::new(Self::from_arrow_data(values)?)))
            }
            _ => (
                data.child_data()
                    .iter()
                    .map(Self::from_arrow_data)
                    .collect::<Result<_>>()?,
                None,
            ),
        };

        Ok(Self {
            length: data.len() as i64,
            null_count: data.null_count() as i64,
            offset: data.offset() as i64,
            buffers,
            children,
            dictionary,
        })
    }

    pub fn with_null_count(mut self, null_count: i64) -> Self {
        self.null_count = null_count;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Buffer>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_children(mut self, children: Vec<ArrayData>) -> Self {
        self.children = children;
        self
    }

    pub fn with_dictionary(mut self, dictionary: ArrayData) -> Self {
        self.dictionary = Some(Box::new(dictionary));
        self
    }

    pub fn set_length(&mut self, length: i64) {
        self.length = length;
    }

    pub fn set_null_count(&mut self, null_count: i64) {
        self.null_count = null_count;
    }

    pub fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    pub fn set_buffers(&mut self, buffers: Vec<Buffer>) {
        self.buffers = buffers;
    }

    pub fn set_buffer(&mut self, i: usize, buffer: Buffer) -> Result<()> {
        let n = self.buffers.len();
        let slot = self
            .buffers
            .get_mut(i)
            .ok_or_else(|| Error::InvalidArgument(format!("buffer {i} out of range for {n}")))?;
        *slot = buffer;
        Ok(())
    }

    pub fn set_children(&mut self, children: Vec<ArrayData>) {
        self.children = children;
    }

    pub fn set_dictionary(&mut self, dictionary: Option<ArrayData>) {
        self.dictionary = dictionary.map(Box::new);
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn null_count(&self) -> i64 {
        self.null_count
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn children(&self) -> &[ArrayData] {
        &self.children
    }

    pub fn dictionary(&self) -> Option<&ArrayData> {
        self.dictionary.as_deref()
    }

    /// Re-checks the structure after in-place edits, without consuming it.
    pub fn validate_after_modify(&self, schema: &SchemaHandle) -> Result<()> {
        ArrayHandle::new(self.clone())?.validate(schema)
    }

    /// Exports and validates against `schema`; the release callback is only
    /// handed out once the whole tree checks out.
    pub fn finish(self, schema: &SchemaHandle) -> Result<ArrayHandle> {
        let handle = ArrayHandle::new(self)?;
        handle.validate(schema)?;
        Ok(handle)
    }

    /// Moves this array into a C structure with a release callback.
    pub fn export(self) -> Result<ArrowArray> {
        if self.length < 0 || self.offset < 0 || self.null_count < -1 {
            return Err(Error::InvalidArgument(format!(
                "invalid length/offset/null_count {}/{}/{}",
                self.length, self.offset, self.null_count
            )));
        }

        let mut private = Box::new(ArrayPrivate {
            buffer_ptrs: self
                .buffers
                .iter()
                .map(|b| b.as_ptr() as *const c_void)
                .collect(),
            buffers: self.buffers,
            children: Vec::with_capacity(self.children.len()),
            dictionary: ptr::null_mut(),
            keep_alive: None,
        });
        for child in self.children {
            private.children.push(Box::into_raw(Box::new(child.export()?)));
        }
        if let Some(dict) = self.dictionary {
            private.dictionary = Box::into_raw(Box::new(dict.export()?));
        }

        Ok(ArrowArray {
            length: self.length,
            null_count: self.null_count,
            offset: self.offset,
            n_buffers: private.buffer_ptrs.len() as i64,
            n_children: private.children.len() as i64,
            buffers: private.buffer_ptrs.as_mut_ptr(),
            children: private.children.as_mut_ptr(),
            dictionary: private.dictionary,
            release: Some(release_array),
            private_data: Box::into_raw(private) as *mut c_void,
        })
    }
}

/// Running 32-bit offsets for values of the given byte lengths.
fn utf8_offsets(lengths: impl Iterator<Item = usize>) -> Result<Vec<i32>> {
    let mut offsets = vec![0i32];
    let mut end = 0i32;
    for len in lengths {
        end = i32::try_from(len)
            .ok()
            .and_then(|len| end.checked_add(len))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "utf8 values past offset {end} do not fit 32-bit offsets"
                ))
            })?;
        offsets.push(end);
    }
    Ok(offsets)
}

fn validity_for(nulls: Option<&NullBuffer>, offset: usize, len: usize) -> Buffer {
    match nulls {
        None => Buffer::null(),
        Some(n) if n.offset() == offset => Buffer::from_arrow(n.buffer().clone()),
        // Bit offsets disagree: repack so bit `offset + i` is element i.
        Some(n) => Buffer::from_vec(pack_bits(
            std::iter::repeat(false)
                .take(offset)
                .chain((0..len).map(|i| n.is_valid(i))),
        )),
    }
}

struct ArrayPrivate {
    buffers: Vec<Buffer>,
    buffer_ptrs: Vec<*const c_void>,
    children: Vec<*mut ArrowArray>,
    dictionary: *mut ArrowArray,
    keep_alive: Option<Box<dyn Any + Send>>,
}

impl Drop for ArrayPrivate {
    fn drop(&mut self) {
        for child in self.children.drain(..) {
            unsafe {
                release_array_in_place(child);
                drop(Box::from_raw(child));
            }
        }
        if !self.dictionary.is_null() {
            unsafe {
                release_array_in_place(self.dictionary);
                drop(Box::from_raw(self.dictionary));
            }
            self.dictionary = ptr::null_mut();
        }
        // Buffers drop after children so shared owners go last.
        self.buffers.clear();
        self.keep_alive.take();
    }
}

unsafe extern "C" fn release_array(array: *mut ArrowArray) {
    if array.is_null() || (*array).release.is_none() {
        return;
    }
    let private = (*array).private_data as *mut ArrayPrivate;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(private))));
    if outcome.is_err() {
        warn!("panic while releasing array; private data leaked");
    }
    (*array).release = None;
    (*array).private_data = ptr::null_mut();
}

/// Keeps a moved-in array alive behind a copy of its fields.
struct WrappedPrivate {
    inner: ArrayHandle,
    _extra: Box<dyn Any + Send>,
}

unsafe extern "C" fn release_wrapped(array: *mut ArrowArray) {
    if array.is_null() || (*array).release.is_none() {
        return;
    }
    let private = (*array).private_data as *mut WrappedPrivate;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(private))));
    if outcome.is_err() {
        warn!("panic while releasing wrapped array; private data leaked");
    }
    (*array).release = None;
    (*array).private_data = ptr::null_mut();
}

/// Read-only view of a live `ArrowArray`.
#[derive(Clone, Copy)]
pub struct ArrayView<'a> {
    raw: &'a ArrowArray,
}

impl<'a> ArrayView<'a> {
    /// # Safety
    /// `raw` must be a live array whose pointers follow the C data interface.
    pub unsafe fn new(raw: &'a ArrowArray) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &'a ArrowArray {
        self.raw
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    pub fn length(&self) -> i64 {
        self.raw.length
    }

    pub fn null_count(&self) -> i64 {
        self.raw.null_count
    }

    pub fn offset(&self) -> i64 {
        self.raw.offset
    }

    pub fn n_buffers(&self) -> usize {
        self.raw.n_buffers.max(0) as usize
    }

    /// Raw address of buffer `i`; null when the producer omitted it.
    pub fn buffer(&self, i: usize) -> *const u8 {
        assert!(i < self.n_buffers(), "buffer index {i} out of range");
        if self.raw.buffers.is_null() {
            return ptr::null();
        }
        unsafe { *self.raw.buffers.add(i) as *const u8 }
    }

    pub fn n_children(&self) -> usize {
        self.raw.n_children.max(0) as usize
    }

    pub fn child(&self, i: usize) -> ArrayView<'a> {
        assert!(i < self.n_children(), "child index {i} out of range");
        unsafe { ArrayView::new(&**self.raw.children.add(i)) }
    }

    pub fn children(&self) -> impl Iterator<Item = ArrayView<'a>> + 'a {
        let this = *self;
        (0..this.n_children()).map(move |i| this.child(i))
    }

    pub fn dictionary(&self) -> Option<ArrayView<'a>> {
        if self.raw.dictionary.is_null() {
            None
        } else {
            Some(unsafe { ArrayView::new(&*self.raw.dictionary) })
        }
    }
}

/// Owning handle around a heap-allocated `ArrowArray`.
#[derive(Debug)]
pub struct ArrayHandle {
    raw: Box<ArrowArray>,
}

unsafe impl Send for ArrayHandle {}
unsafe impl Sync for ArrayHandle {}

impl ArrayHandle {
    pub fn new(data: ArrayData) -> Result<Self> {
        Ok(Self {
            raw: Box::new(data.export()?),
        })
    }

    pub fn empty() -> Self {
        Self {
            raw: Box::new(ArrowArray::empty()),
        }
    }

    /// Takes ownership of a foreign array, leaving `src` released.
    ///
    /// # Safety
    /// `src` must point to a valid `ArrowArray`.
    pub unsafe fn from_raw(src: *mut ArrowArray) -> Result<Self> {
        if src.is_null() {
            return Err(Error::InvalidArgument("null array pointer".into()));
        }
        if (*src).is_released() {
            return Err(Error::Released("array"));
        }
        let raw = Box::new(ptr::read(src));
        (*src).release = None;
        Ok(Self { raw })
    }

    /// Moves the array into caller-provided storage.
    ///
    /// # Safety
    /// `dst` must be valid for writes and must not hold a live array.
    pub unsafe fn export_to(mut self, dst: *mut ArrowArray) {
        ptr::write(dst, ptr::read(&*self.raw));
        self.raw.release = None;
    }

    pub fn into_raw(self) -> *mut ArrowArray {
        let this = std::mem::ManuallyDrop::new(self);
        let raw = unsafe { ptr::read(&this.raw) };
        Box::into_raw(raw)
    }

    /// Moves the raw structure out, leaving this handle released.
    pub fn take_raw(&mut self) -> ArrowArray {
        let out = unsafe { ptr::read(&*self.raw) };
        self.raw.release = None;
        out
    }

    pub fn as_ptr(&self) -> *const ArrowArray {
        &*self.raw
    }

    pub fn as_mut_ptr(&mut self) -> *mut ArrowArray {
        &mut *self.raw
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    pub fn release(&mut self) {
        unsafe { release_array_in_place(&mut *self.raw) };
    }

    pub fn view(&self) -> Result<ArrayView<'_>> {
        if self.is_released() {
            return Err(Error::Released("array"));
        }
        Ok(unsafe { ArrayView::new(&self.raw) })
    }

    pub fn length(&self) -> i64 {
        self.raw.length
    }

    pub fn validate(&self, schema: &SchemaHandle) -> Result<()> {
        validate(self.view()?, schema.view()?)
    }

    /// Detaches child `i` into its own handle; the parent keeps a released slot.
    pub fn take_child(&mut self, i: usize) -> Result<ArrayHandle> {
        let n = self.view()?.n_children();
        if i >= n {
            return Err(Error::InvalidArgument(format!(
                "child {i} out of range for {n} children"
            )));
        }
        unsafe { Self::from_raw(*self.raw.children.add(i)) }
    }

    /// Re-exports this array with `extra` kept alive until release.
    ///
    /// Field values and buffer addresses are unchanged; only the release
    /// callback differs.
    pub fn with_keep_alive<T: Any + Send>(mut self, extra: T) -> ArrayHandle {
        if self.is_released() {
            return self;
        }
        let mut raw = ArrowArray {
            length: self.raw.length,
            null_count: self.raw.null_count,
            offset: self.raw.offset,
            n_buffers: self.raw.n_buffers,
            n_children: self.raw.n_children,
            buffers: self.raw.buffers,
            children: self.raw.children,
            dictionary: self.raw.dictionary,
            release: Some(release_wrapped),
            private_data: ptr::null_mut(),
        };
        let inner = ArrayHandle {
            raw: Box::new(self.take_raw()),
        };
        raw.private_data = Box::into_raw(Box::new(WrappedPrivate {
            inner,
            _extra: Box::new(extra),
        })) as *mut c_void;
        ArrayHandle { raw: Box::new(raw) }
    }
}

impl Drop for ArrayHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int32Array, StringArray};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn utf8_offsets_overflow_is_an_error() {
        assert_eq!(utf8_offsets([2, 0, 3].into_iter()).unwrap(), vec![0, 2, 2, 5]);
        let half = i32::MAX as usize / 2 + 1;
        assert!(matches!(
            utf8_offsets([half, half].into_iter()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(utf8_offsets([usize::MAX].into_iter()).is_err());

        let data = ArrayData::from_strings(&[Some("ab"), None, Some("c")]).unwrap();
        assert_eq!(data.length(), 3);
        assert_eq!(data.null_count(), 1);
    }

    #[test]
    fn export_view_and_release() {
        let mut handle = ArrayHandle::new(ArrayData::from_values(&[1i32, 2, 3])).unwrap();
        let view = handle.view().unwrap();
        assert_eq!(view.length(), 3);
        assert_eq!(view.n_buffers(), 2);
        assert!(view.buffer(0).is_null());
        let values = unsafe { std::slice::from_raw_parts(view.buffer(1) as *const i32, 3) };
        assert_eq!(values, &[1, 2, 3]);

        handle.release();
        assert!(handle.is_released());
        handle.release();
        assert!(matches!(handle.view(), Err(Error::Released("array"))));
    }

    #[test]
    fn release_frees_children_and_dictionary() {
        let drops = Arc::new(AtomicUsize::new(0));
        let owned = |n: u8| unsafe {
            let data = vec![n; 4];
            Buffer::from_owner(data.as_ptr(), 4, (data, DropCounter(drops.clone())))
        };
        let data = ArrayData::new(1)
            .with_buffers(vec![Buffer::null()])
            .with_children(vec![
                ArrayData::new(1).with_buffers(vec![Buffer::null(), owned(1)]),
                ArrayData::new(1).with_buffers(vec![Buffer::null(), owned(2)]),
            ])
            .with_dictionary(ArrayData::new(1).with_buffers(vec![Buffer::null(), owned(3)]));
        let handle = ArrayHandle::new(data).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn detached_child_survives_parent_release() {
        let data = ArrayData::new(2)
            .with_buffers(vec![Buffer::null()])
            .with_children(vec![ArrayData::from_values(&[7i64, 8])]);
        let mut parent = ArrayHandle::new(data).unwrap();
        let child = parent.take_child(0).unwrap();
        drop(parent);
        let view = child.view().unwrap();
        let values = unsafe { std::slice::from_raw_parts(view.buffer(1) as *const i64, 2) };
        assert_eq!(values, &[7, 8]);
    }

    #[test]
    fn keep_alive_is_dropped_with_array() {
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = ArrayHandle::new(ArrayData::from_values(&[1u8]))
            .unwrap()
            .with_keep_alive(DropCounter(drops.clone()));
        assert_eq!(handle.view().unwrap().length(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_arrow_shares_buffers() {
        let source = Int32Array::from(vec![Some(1), None, Some(3)]);
        let data = ArrayData::from_arrow(&source).unwrap();
        assert_eq!(data.length(), 3);
        assert_eq!(data.null_count(), 1);
        assert_eq!(data.buffers().len(), 2);
        assert_eq!(
            data.buffers()[1].as_ptr(),
            source.values().inner().as_ptr()
        );
    }

    #[test]
    fn from_arrow_sliced_strings() {
        let source = StringArray::from(vec![Some("a"), None, Some("ccc"), Some("dd")]);
        let sliced = source.slice(1, 3);
        let data = ArrayData::from_arrow(&sliced).unwrap();
        let validity = data.buffers()[0].as_slice().unwrap();
        let bit = |i: i64| {
            let at = data.offset() + i;
            validity[(at / 8) as usize] >> (at % 8) & 1
        };
        assert_eq!(data.length(), 3);
        assert_eq!(data.buffers().len(), 3);
        assert_eq!((bit(0), bit(1), bit(2)), (0, 1, 1));
    }

    #[test]
    fn empty_for_matches_schema_shape() {
        let schema = Schema::new("+s").with_children(vec![
            Schema::new("u").with_name("s"),
            Schema::new("i").with_name("d").with_dictionary(Schema::new("g")),
        ]);
        let data = ArrayData::empty_for(&schema).unwrap();
        assert_eq!(data.buffers().len(), 1);
        assert_eq!(data.children().len(), 2);
        assert_eq!(data.children()[0].buffers().len(), 3);
        assert!(data.children()[1].dictionary().is_some());
        let schema = SchemaHandle::new(schema).unwrap();
        assert!(data.finish(&schema).is_ok());
    }

    #[test]
    fn negative_length_rejected() {
        assert!(ArrayData::new(-1).export().is_err());
    }
}
