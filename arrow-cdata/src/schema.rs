//! Schema descriptors: an owned builder, the exported C structure and an
//! owning handle that releases it exactly once.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use arrow_schema::{DataType, Field, Fields};
use tracing::warn;

use crate::error::{Error, Result};
use crate::ffi::{
    release_schema_in_place, ArrowSchema, FLAG_DICTIONARY_ORDERED, FLAG_MAP_KEYS_SORTED,
    FLAG_NULLABLE,
};
use crate::format::{format_of, parse_format, type_name};

/// Owned description of a logical type, built before export.
///
/// Nothing here is visible across the boundary until [`Schema::export`]
/// installs a release callback over a fully populated structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    format: String,
    name: Option<String>,
    metadata: Vec<(String, String)>,
    flags: i64,
    children: Vec<Schema>,
    dictionary: Option<Box<Schema>>,
}

impl Schema {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            name: None,
            metadata: Vec::new(),
            flags: FLAG_NULLABLE,
            children: Vec::new(),
            dictionary: None,
        }
    }

    /// Schema for an arrow-rs data type, nullable, with children named after
    /// the nested fields.
    pub fn from_type(dt: &DataType) -> Result<Self> {
        if let DataType::Dictionary(key, value) = dt {
            let mut schema = Self::new(format_of(key)?);
            schema.dictionary = Some(Box::new(Self::from_type(value)?));
            return Ok(schema);
        }

        let mut schema = Self::new(format_of(dt)?);
        schema.children = match dt {
            DataType::List(f) | DataType::LargeList(f) | DataType::FixedSizeList(f, _) => {
                vec![Self::from_field(f)?]
            }
            DataType::Map(f, sorted) => {
                if *sorted {
                    schema.flags |= FLAG_MAP_KEYS_SORTED;
                }
                vec![Self::from_field(f)?]
            }
            DataType::Struct(fields) => fields
                .iter()
                .map(|f| Self::from_field(f))
                .collect::<Result<_>>()?,
            DataType::Union(fields, _) => fields
                .iter()
                .map(|(_, f)| Self::from_field(f))
                .collect::<Result<_>>()?,
            DataType::RunEndEncoded(run_ends, values) => {
                vec![Self::from_field(run_ends)?, Self::from_field(values)?]
            }
            _ => Vec::new(),
        };
        Ok(schema)
    }

    pub fn from_field(field: &Field) -> Result<Self> {
        let mut schema = Self::from_type(field.data_type())?;
        schema.name = Some(field.name().clone());
        schema.set_nullable(field.is_nullable());
        if field.dict_is_ordered() == Some(true) {
            schema.flags |= FLAG_DICTIONARY_ORDERED;
        }
        let mut metadata: Vec<_> = field
            .metadata()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.sort();
        schema.metadata = metadata;
        Ok(schema)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_flags(mut self, flags: i64) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<(String, String)>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_children(mut self, children: Vec<Schema>) -> Self {
        self.children = children;
        self
    }

    pub fn with_dictionary(mut self, dictionary: Schema) -> Self {
        self.dictionary = Some(Box::new(dictionary));
        self
    }

    pub fn set_format(&mut self, format: impl Into<String>) {
        self.format = format.into();
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn set_metadata(&mut self, metadata: Vec<(String, String)>) {
        self.metadata = metadata;
    }

    pub fn set_flags(&mut self, flags: i64) {
        self.flags = flags;
    }

    pub fn set_nullable(&mut self, nullable: bool) {
        if nullable {
            self.flags |= FLAG_NULLABLE;
        } else {
            self.flags &= !FLAG_NULLABLE;
        }
    }

    pub fn set_children(&mut self, children: Vec<Schema>) {
        self.children = children;
    }

    pub fn push_child(&mut self, child: Schema) {
        self.children.push(child);
    }

    pub fn set_dictionary(&mut self, dictionary: Option<Schema>) {
        self.dictionary = dictionary.map(Box::new);
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn flags(&self) -> i64 {
        self.flags
    }

    pub fn is_nullable(&self) -> bool {
        self.flags & FLAG_NULLABLE != 0
    }

    pub fn children(&self) -> &[Schema] {
        &self.children
    }

    pub fn dictionary(&self) -> Option<&Schema> {
        self.dictionary.as_deref()
    }

    pub fn data_type(&self) -> Result<DataType> {
        let children = self
            .children
            .iter()
            .map(Schema::to_field)
            .collect::<Result<Vec<_>>>()?;
        let value = parse_format(&self.format, &children)?;
        let value = match value {
            DataType::Map(entries, _) => {
                DataType::Map(entries, self.flags & FLAG_MAP_KEYS_SORTED != 0)
            }
            other => other,
        };
        match &self.dictionary {
            Some(dict) => Ok(DataType::Dictionary(
                Box::new(value),
                Box::new(dict.data_type()?),
            )),
            None => Ok(value),
        }
    }

    pub fn to_field(&self) -> Result<Field> {
        let metadata: HashMap<String, String> = self.metadata.iter().cloned().collect();
        Ok(Field::new(
            self.name.clone().unwrap_or_default(),
            self.data_type()?,
            self.is_nullable(),
        )
        .with_metadata(metadata))
    }

    /// Readable type string, e.g. `struct<a: int32, b: list<item: string>>`.
    pub fn format_recursive(&self) -> Result<String> {
        let leaf = {
            let children: Vec<Field> = self
                .children
                .iter()
                .map(Schema::to_field)
                .collect::<Result<_>>()?;
            type_name(&parse_format(&self.format, &children)?)
        };
        let mut out = match &self.dictionary {
            Some(dict) => format!("dictionary({leaf})<{}>", dict.format_recursive()?),
            None => leaf,
        };
        if !self.children.is_empty() {
            let parts = self
                .children
                .iter()
                .map(|c| {
                    Ok(format!(
                        "{}: {}",
                        c.name.as_deref().unwrap_or(""),
                        c.format_recursive()?
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            out = format!("{out}<{}>", parts.join(", "));
        }
        Ok(out)
    }

    /// Moves this schema into a C structure with a release callback.
    pub fn export(self) -> Result<ArrowSchema> {
        let format = CString::new(self.format)
            .map_err(|_| Error::InvalidArgument("format contains a NUL byte".into()))?;
        let name = self
            .name
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::InvalidArgument("name contains a NUL byte".into()))?;
        let metadata = encode_metadata(&self.metadata)?;

        // Children are exported first; anything already exported is released
        // by the private data's drop if a later child fails.
        let mut private = Box::new(SchemaPrivate {
            format,
            name,
            metadata,
            children: Vec::with_capacity(self.children.len()),
            dictionary: ptr::null_mut(),
        });
        for child in self.children {
            private.children.push(Box::into_raw(Box::new(child.export()?)));
        }
        if let Some(dict) = self.dictionary {
            private.dictionary = Box::into_raw(Box::new(dict.export()?));
        }

        Ok(ArrowSchema {
            format: private.format.as_ptr(),
            name: private.name.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
            metadata: private
                .metadata
                .as_ref()
                .map_or(ptr::null(), |m| m.as_ptr() as *const c_char),
            flags: self.flags,
            n_children: private.children.len() as i64,
            children: private.children.as_mut_ptr(),
            dictionary: private.dictionary,
            release: Some(release_schema),
            private_data: Box::into_raw(private) as *mut c_void,
        })
    }
}

struct SchemaPrivate {
    format: CString,
    name: Option<CString>,
    metadata: Option<Vec<u8>>,
    children: Vec<*mut ArrowSchema>,
    dictionary: *mut ArrowSchema,
}

impl Drop for SchemaPrivate {
    fn drop(&mut self) {
        // Children detached by a consumer have a null release and are only freed.
        for child in self.children.drain(..) {
            unsafe {
                release_schema_in_place(child);
                drop(Box::from_raw(child));
            }
        }
        if !self.dictionary.is_null() {
            unsafe {
                release_schema_in_place(self.dictionary);
                drop(Box::from_raw(self.dictionary));
            }
            self.dictionary = ptr::null_mut();
        }
    }
}

unsafe extern "C" fn release_schema(schema: *mut ArrowSchema) {
    if schema.is_null() || (*schema).release.is_none() {
        return;
    }
    let private = (*schema).private_data as *mut SchemaPrivate;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drop(Box::from_raw(private))));
    if outcome.is_err() {
        warn!("panic while releasing schema; private data leaked");
    }
    (*schema).release = None;
    (*schema).private_data = ptr::null_mut();
}

/// Encodes key/value pairs in the C data interface metadata layout.
pub fn encode_metadata(pairs: &[(String, String)]) -> Result<Option<Vec<u8>>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let as_i32 = |n: usize| {
        i32::try_from(n).map_err(|_| Error::InvalidArgument("metadata too large".into()))
    };
    let mut out = Vec::new();
    out.extend_from_slice(&as_i32(pairs.len())?.to_ne_bytes());
    for (k, v) in pairs {
        out.extend_from_slice(&as_i32(k.len())?.to_ne_bytes());
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(&as_i32(v.len())?.to_ne_bytes());
        out.extend_from_slice(v.as_bytes());
    }
    Ok(Some(out))
}

/// Decodes C data interface metadata.
///
/// # Safety
/// `ptr` must be null or point to a well-formed metadata block.
pub unsafe fn decode_metadata(ptr: *const c_char) -> Result<Vec<(String, String)>> {
    if ptr.is_null() {
        return Ok(Vec::new());
    }
    let mut cursor = ptr as *const u8;
    let n = read_i32(&mut cursor);
    if n < 0 {
        return Err(Error::InvalidArgument("negative metadata pair count".into()));
    }
    let mut pairs = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let key = read_string(&mut cursor)?;
        let value = read_string(&mut cursor)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

unsafe fn read_i32(cursor: &mut *const u8) -> i32 {
    let v = i32::from_ne_bytes(ptr::read_unaligned(*cursor as *const [u8; 4]));
    *cursor = cursor.add(4);
    v
}

unsafe fn read_string(cursor: &mut *const u8) -> Result<String> {
    let len = read_i32(cursor);
    if len < 0 {
        return Err(Error::InvalidArgument("negative metadata length".into()));
    }
    let bytes = std::slice::from_raw_parts(*cursor, len as usize).to_vec();
    *cursor = cursor.add(len as usize);
    String::from_utf8(bytes)
        .map_err(|_| Error::InvalidArgument("metadata is not valid UTF-8".into()))
}

/// Read-only view of a live `ArrowSchema`.
#[derive(Clone, Copy)]
pub struct SchemaView<'a> {
    raw: &'a ArrowSchema,
}

impl<'a> SchemaView<'a> {
    /// # Safety
    /// `raw` must be a live schema whose pointers follow the C data interface.
    pub unsafe fn new(raw: &'a ArrowSchema) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &'a ArrowSchema {
        self.raw
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    pub fn format(&self) -> Result<&'a str> {
        if self.raw.format.is_null() {
            return Err(Error::invalid_format("", "format is null"));
        }
        unsafe { CStr::from_ptr(self.raw.format) }
            .to_str()
            .map_err(|_| Error::invalid_format("", "format is not UTF-8"))
    }

    pub fn name(&self) -> Option<&'a str> {
        if self.raw.name.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(self.raw.name) }.to_str().ok()
    }

    pub fn metadata(&self) -> Result<Vec<(String, String)>> {
        unsafe { decode_metadata(self.raw.metadata) }
    }

    pub fn flags(&self) -> i64 {
        self.raw.flags
    }

    pub fn n_children(&self) -> usize {
        self.raw.n_children.max(0) as usize
    }

    pub fn child(&self, i: usize) -> SchemaView<'a> {
        assert!(i < self.n_children(), "child index {i} out of range");
        unsafe { SchemaView::new(&**self.raw.children.add(i)) }
    }

    pub fn children(&self) -> impl Iterator<Item = SchemaView<'a>> + 'a {
        let this = *self;
        (0..this.n_children()).map(move |i| this.child(i))
    }

    pub fn dictionary(&self) -> Option<SchemaView<'a>> {
        if self.raw.dictionary.is_null() {
            None
        } else {
            Some(unsafe { SchemaView::new(&*self.raw.dictionary) })
        }
    }

    /// Deep copy into an owned [`Schema`].
    pub fn to_schema(&self) -> Result<Schema> {
        if self.is_released() {
            return Err(Error::Released("schema"));
        }
        Ok(Schema {
            format: self.format()?.to_string(),
            name: self.name().map(str::to_string),
            metadata: self.metadata()?,
            flags: self.flags(),
            children: self
                .children()
                .map(|c| c.to_schema())
                .collect::<Result<_>>()?,
            dictionary: self
                .dictionary()
                .map(|d| d.to_schema().map(Box::new))
                .transpose()?,
        })
    }

    pub fn data_type(&self) -> Result<DataType> {
        self.to_schema()?.data_type()
    }

    pub fn child_fields(&self) -> Result<Fields> {
        self.children()
            .map(|c| c.to_schema()?.to_field())
            .collect::<Result<Vec<_>>>()
            .map(Fields::from)
    }
}

/// Owning handle around a heap-allocated `ArrowSchema`.
///
/// Dropping the handle releases the schema; calling [`SchemaHandle::release`]
/// first makes the drop a no-op.
#[derive(Debug)]
pub struct SchemaHandle {
    raw: Box<ArrowSchema>,
}

unsafe impl Send for SchemaHandle {}
unsafe impl Sync for SchemaHandle {}

impl SchemaHandle {
    pub fn new(schema: Schema) -> Result<Self> {
        Ok(Self {
            raw: Box::new(schema.export()?),
        })
    }

    /// A released handle, usable as an output slot for a foreign producer.
    pub fn empty() -> Self {
        Self {
            raw: Box::new(ArrowSchema::empty()),
        }
    }

    /// Takes ownership of a foreign schema, leaving `src` released.
    ///
    /// # Safety
    /// `src` must point to a valid `ArrowSchema`.
    pub unsafe fn from_raw(src: *mut ArrowSchema) -> Result<Self> {
        if src.is_null() {
            return Err(Error::InvalidArgument("null schema pointer".into()));
        }
        if (*src).is_released() {
            return Err(Error::Released("schema"));
        }
        let raw = Box::new(ptr::read(src));
        (*src).release = None;
        Ok(Self { raw })
    }

    /// Moves the schema into caller-provided storage.
    ///
    /// # Safety
    /// `dst` must be valid for writes and must not hold a live schema.
    pub unsafe fn export_to(mut self, dst: *mut ArrowSchema) {
        ptr::write(dst, ptr::read(&*self.raw));
        self.raw.release = None;
    }

    /// Leaks the structure to a foreign owner, who must release and free it.
    pub fn into_raw(self) -> *mut ArrowSchema {
        let this = std::mem::ManuallyDrop::new(self);
        // Moving the box out of the ManuallyDrop skips our Drop impl.
        let raw = unsafe { ptr::read(&this.raw) };
        Box::into_raw(raw)
    }

    pub fn as_ptr(&self) -> *const ArrowSchema {
        &*self.raw
    }

    pub fn as_mut_ptr(&mut self) -> *mut ArrowSchema {
        &mut *self.raw
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    pub fn release(&mut self) {
        unsafe { release_schema_in_place(&mut *self.raw) };
    }

    pub fn view(&self) -> Result<SchemaView<'_>> {
        if self.is_released() {
            return Err(Error::Released("schema"));
        }
        Ok(unsafe { SchemaView::new(&self.raw) })
    }

    pub fn to_schema(&self) -> Result<Schema> {
        self.view()?.to_schema()
    }

    pub fn data_type(&self) -> Result<DataType> {
        self.view()?.data_type()
    }

    /// Detaches child `i` into its own handle; the parent keeps a released slot.
    pub fn take_child(&mut self, i: usize) -> Result<SchemaHandle> {
        let n = self.view()?.n_children();
        if i >= n {
            return Err(Error::InvalidArgument(format!(
                "child {i} out of range for {n} children"
            )));
        }
        unsafe { Self::from_raw(*self.raw.children.add(i)) }
    }

    pub fn try_clone(&self) -> Result<SchemaHandle> {
        SchemaHandle::new(self.to_schema()?)
    }
}

impl Drop for SchemaHandle {
    fn drop(&mut self) {
        self.release();
    }
}
