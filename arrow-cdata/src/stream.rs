//! Array streams: a pull-based sequence of arrays sharing one schema.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use tracing::{debug, warn};

use crate::array::ArrayHandle;
use crate::error::{Error, Result, EINVAL, EIO};
use crate::ffi::{release_stream_in_place, ArrowArray, ArrowArrayStream, ArrowSchema};
use crate::schema::{Schema, SchemaHandle};

type ArrayIter = Box<dyn Iterator<Item = Result<ArrayHandle>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Exhausted,
    Errored(c_int),
}

struct StreamPrivate {
    schema: SchemaHandle,
    arrays: ArrayIter,
    validate: bool,
    state: StreamState,
    last_error: Option<CString>,
}

impl StreamPrivate {
    fn fail(&mut self, err: &Error) -> c_int {
        let code = err.errno();
        debug!(error = %err, "array stream failed");
        self.last_error = CString::new(err.to_string().replace('\0', " ")).ok();
        code
    }

    fn get_schema(&mut self, out: *mut ArrowSchema) -> c_int {
        match self.schema.try_clone() {
            Ok(schema) => {
                unsafe { schema.export_to(out) };
                0
            }
            Err(e) => self.fail(&e),
        }
    }

    fn get_next(&mut self, out: *mut ArrowArray) -> c_int {
        match self.state {
            StreamState::Errored(code) => return code,
            StreamState::Exhausted => {
                unsafe { ptr::write(out, ArrowArray::empty()) };
                return 0;
            }
            StreamState::Open => {}
        }
        let next = match self.arrays.next() {
            None => {
                self.state = StreamState::Exhausted;
                unsafe { ptr::write(out, ArrowArray::empty()) };
                return 0;
            }
            Some(next) => next,
        };
        let checked = next.and_then(|array| {
            if self.validate {
                array.validate(&self.schema)?;
            }
            Ok(array)
        });
        match checked {
            Ok(array) => {
                unsafe { array.export_to(out) };
                0
            }
            Err(e) => {
                let code = self.fail(&e);
                self.state = StreamState::Errored(code);
                code
            }
        }
    }
}

fn private_of<'a>(stream: *mut ArrowArrayStream) -> Option<&'a mut StreamPrivate> {
    if stream.is_null() {
        return None;
    }
    unsafe {
        if (*stream).release.is_none() || (*stream).private_data.is_null() {
            return None;
        }
        Some(&mut *((*stream).private_data as *mut StreamPrivate))
    }
}

unsafe extern "C" fn stream_get_schema(
    stream: *mut ArrowArrayStream,
    out: *mut ArrowSchema,
) -> c_int {
    let Some(private) = private_of(stream) else {
        return EINVAL;
    };
    if out.is_null() {
        return EINVAL;
    }
    panic::catch_unwind(AssertUnwindSafe(|| private.get_schema(out))).unwrap_or(EIO)
}

unsafe extern "C" fn stream_get_next(stream: *mut ArrowArrayStream, out: *mut ArrowArray) -> c_int {
    let Some(private) = private_of(stream) else {
        return EINVAL;
    };
    if out.is_null() {
        return EINVAL;
    }
    panic::catch_unwind(AssertUnwindSafe(|| private.get_next(out))).unwrap_or_else(|_| {
        warn!("panic in array stream producer");
        EIO
    })
}

unsafe extern "C" fn stream_get_last_error(stream: *mut ArrowArrayStream) -> *const c_char {
    match private_of(stream).and_then(|p| p.last_error.as_ref()) {
        Some(msg) => msg.as_ptr(),
        None => ptr::null(),
    }
}

unsafe extern "C" fn stream_release(stream: *mut ArrowArrayStream) {
    if stream.is_null() || (*stream).release.is_none() {
        return;
    }
    let private = (*stream).private_data as *mut StreamPrivate;
    if panic::catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(private)))).is_err() {
        warn!("panic while releasing array stream");
    }
    (*stream).release = None;
    (*stream).private_data = ptr::null_mut();
}

/// Exports a stream that pulls arrays from `arrays`.
///
/// With `validate` set, each array is checked against `schema` before it is
/// handed out and a mismatch puts the stream into its error state.
pub fn export_stream<I>(schema: Schema, arrays: I, validate: bool) -> Result<ArrowArrayStream>
where
    I: IntoIterator<Item = Result<ArrayHandle>>,
    I::IntoIter: Send + 'static,
{
    let private = Box::new(StreamPrivate {
        schema: SchemaHandle::new(schema)?,
        arrays: Box::new(arrays.into_iter()),
        validate,
        state: StreamState::Open,
        last_error: None,
    });
    Ok(ArrowArrayStream {
        get_schema: Some(stream_get_schema),
        get_next: Some(stream_get_next),
        get_last_error: Some(stream_get_last_error),
        release: Some(stream_release),
        private_data: Box::into_raw(private) as *mut c_void,
    })
}

/// A stream over arrays already in memory.
pub struct BasicArrayStream;

impl BasicArrayStream {
    /// Validates every array upfront when `validate` is set, so a bad array
    /// fails construction rather than surfacing mid-stream.
    pub fn new(schema: Schema, arrays: Vec<ArrayHandle>, validate: bool) -> Result<StreamHandle> {
        if validate {
            let handle = SchemaHandle::new(schema.clone())?;
            for (i, array) in arrays.iter().enumerate() {
                array.validate(&handle).map_err(|e| match e {
                    Error::Validation(mut v) => {
                        v.path = format!("arrays[{i}].{}", v.path);
                        Error::Validation(v)
                    }
                    other => other,
                })?;
            }
        }
        StreamHandle::new(schema, arrays.into_iter().map(Ok), false)
    }
}

/// Owning handle around a heap-allocated `ArrowArrayStream`.
#[derive(Debug)]
pub struct StreamHandle {
    raw: Box<ArrowArrayStream>,
    /// Set once iteration has yielded an error; `next` then returns `None`.
    failed: bool,
}

unsafe impl Send for StreamHandle {}

impl StreamHandle {
    pub fn new<I>(schema: Schema, arrays: I, validate: bool) -> Result<Self>
    where
        I: IntoIterator<Item = Result<ArrayHandle>>,
        I::IntoIter: Send + 'static,
    {
        Ok(Self {
            raw: Box::new(export_stream(schema, arrays, validate)?),
            failed: false,
        })
    }

    /// Takes ownership of a foreign stream, leaving `src` released.
    ///
    /// # Safety
    /// `src` must point to a valid `ArrowArrayStream`.
    pub unsafe fn from_raw(src: *mut ArrowArrayStream) -> Result<Self> {
        if src.is_null() {
            return Err(Error::InvalidArgument("null stream pointer".into()));
        }
        if (*src).is_released() {
            return Err(Error::Released("array stream"));
        }
        let raw = Box::new(ptr::read(src));
        (*src).release = None;
        Ok(Self { raw, failed: false })
    }

    /// # Safety
    /// `dst` must be valid for writes and must not hold a live stream.
    pub unsafe fn export_to(mut self, dst: *mut ArrowArrayStream) {
        ptr::write(dst, ptr::read(&*self.raw));
        self.raw.release = None;
    }

    pub fn into_raw(self) -> *mut ArrowArrayStream {
        let this = std::mem::ManuallyDrop::new(self);
        let raw = unsafe { ptr::read(&this.raw) };
        Box::into_raw(raw)
    }

    pub fn as_mut_ptr(&mut self) -> *mut ArrowArrayStream {
        &mut *self.raw
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    pub fn release(&mut self) {
        unsafe { release_stream_in_place(&mut *self.raw) };
    }

    pub fn schema(&mut self) -> Result<SchemaHandle> {
        if self.is_released() {
            return Err(Error::Released("array stream"));
        }
        let get_schema = self
            .raw
            .get_schema
            .ok_or_else(|| Error::Stream("stream has no get_schema callback".into()))?;
        let mut out = ArrowSchema::empty();
        let code = unsafe { get_schema(&mut *self.raw, &mut out) };
        if code != 0 {
            return Err(self.error_for(code));
        }
        unsafe { SchemaHandle::from_raw(&mut out) }
    }

    /// The next array, or `None` once the stream is exhausted.
    pub fn next_array(&mut self) -> Result<Option<ArrayHandle>> {
        if self.is_released() {
            return Err(Error::Released("array stream"));
        }
        let get_next = self
            .raw
            .get_next
            .ok_or_else(|| Error::Stream("stream has no get_next callback".into()))?;
        let mut out = ArrowArray::empty();
        let code = unsafe { get_next(&mut *self.raw, &mut out) };
        if code != 0 {
            return Err(self.error_for(code));
        }
        if out.is_released() {
            return Ok(None);
        }
        unsafe { ArrayHandle::from_raw(&mut out).map(Some) }
    }

    pub fn last_error(&mut self) -> Option<String> {
        if self.is_released() {
            return None;
        }
        let get_last_error = self.raw.get_last_error?;
        let msg = unsafe { get_last_error(&mut *self.raw) };
        if msg.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
    }

    fn error_for(&mut self, code: c_int) -> Error {
        let message = self
            .last_error()
            .unwrap_or_else(|| format!("stream callback returned errno {code}"));
        Error::Stream(message)
    }
}

impl Iterator for StreamHandle {
    type Item = Result<ArrayHandle>;

    /// Yields the first error once, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.next_array().transpose();
        self.failed = matches!(item, Some(Err(_)));
        item
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}
