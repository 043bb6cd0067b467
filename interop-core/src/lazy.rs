//! Vectors that convert their backing Arrow array on first access.

use std::fmt;
use std::sync::Arc;

use arrow_cdata::{ArrayHandle, ArrayView, Error as CdataError, SchemaHandle, SchemaView};
use device_memory::DeviceArray;
use parking_lot::Mutex;
use tracing::debug;

use crate::convert::{Converter, HostConverter, HostVector};
use crate::error::{InteropError, Result};

/// One step from a node of an array tree to a node below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStep {
    Child(usize),
    Dictionary,
}

/// A window over one node of a shared array tree, plus the converter that
/// turns it into a [`HostVector`].
#[derive(Clone)]
pub struct LazySource {
    array: Arc<ArrayHandle>,
    schema: Arc<SchemaHandle>,
    path: Vec<PathStep>,
    start: usize,
    len: usize,
    converter: Arc<dyn Converter>,
}

impl LazySource {
    pub fn path(&self) -> &[PathStep] {
        &self.path
    }

    /// First logical element of the window, before the node's own offset.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Walks the path down from the root array and schema.
    pub fn node(&self) -> Result<(ArrayView<'_>, SchemaView<'_>)> {
        let mut array = self.array.view()?;
        let mut schema = self.schema.view()?;
        for step in &self.path {
            match *step {
                PathStep::Child(i) => {
                    if i >= array.n_children() || i >= schema.n_children() {
                        return Err(CdataError::InvalidArgument(format!(
                            "child {i} out of range"
                        ))
                        .into());
                    }
                    array = array.child(i);
                    schema = schema.child(i);
                }
                PathStep::Dictionary => match (array.dictionary(), schema.dictionary()) {
                    (Some(a), Some(s)) => {
                        array = a;
                        schema = s;
                    }
                    _ => return Err(CdataError::Released("dictionary").into()),
                },
            }
        }
        Ok((array, schema))
    }

    /// Same tree and converter, different node and window.
    pub(crate) fn relocate(&self, path: Vec<PathStep>, start: usize, len: usize) -> LazySource {
        LazySource {
            array: self.array.clone(),
            schema: self.schema.clone(),
            path,
            start,
            len,
            converter: self.converter.clone(),
        }
    }

    fn convert(&self) -> Result<HostVector> {
        self.converter.convert(self)
    }
}

enum LazyState {
    Unmaterialized(LazySource),
    Materialized(Arc<HostVector>),
}

/// A vector whose contents are converted from Arrow at most once.
///
/// Clones share state: materializing one materializes all of them. Once
/// converted, the source is dropped and with it this vector's hold on the
/// Arrow array.
#[derive(Clone)]
pub struct LazyVector {
    state: Arc<Mutex<LazyState>>,
    len: usize,
}

impl LazyVector {
    /// Validates `array` against `schema` and wraps it with the default
    /// host converter.
    pub fn new(array: ArrayHandle, schema: SchemaHandle) -> Result<Self> {
        Self::with_converter(array, schema, Arc::new(HostConverter))
    }

    pub fn with_converter(
        array: ArrayHandle,
        schema: SchemaHandle,
        converter: Arc<dyn Converter>,
    ) -> Result<Self> {
        array.validate(&schema)?;
        let len = array.length().max(0) as usize;
        Ok(Self::from_source(LazySource {
            array: Arc::new(array),
            schema: Arc::new(schema),
            path: Vec::new(),
            start: 0,
            len,
            converter,
        }))
    }

    /// Wraps a device array whose buffers the host can read directly.
    pub fn from_device_array(array: DeviceArray, schema: SchemaHandle) -> Result<Self> {
        let device = array.device_id();
        if !device.device_type.is_host_accessible() {
            return Err(InteropError::NotHostResident(device.to_string()));
        }
        Self::new(array.into_array()?, schema)
    }

    pub(crate) fn from_source(source: LazySource) -> Self {
        let len = source.len;
        Self {
            state: Arc::new(Mutex::new(LazyState::Unmaterialized(source))),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_materialized(&self) -> bool {
        matches!(*self.state.lock(), LazyState::Materialized(_))
    }

    /// Converts now if not yet converted. With `recursive`, nested struct
    /// fields are forced too. A failed conversion leaves the vector
    /// unmaterialized.
    pub fn force_materialize(&self, recursive: bool) -> Result<Arc<HostVector>> {
        let value = {
            let mut state = self.state.lock();
            let value = match &*state {
                LazyState::Materialized(value) => value.clone(),
                LazyState::Unmaterialized(source) => Arc::new(source.convert()?),
            };
            if !matches!(*state, LazyState::Materialized(_)) {
                debug!(len = self.len, "materialized lazy vector");
                *state = LazyState::Materialized(value.clone());
            }
            value
        };
        if recursive {
            value.materialize_nested()?;
        }
        Ok(value)
    }

    pub fn value(&self) -> Result<Arc<HostVector>> {
        self.force_materialize(false)
    }
}

impl PartialEq for LazyVector {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.state, &other.state) {
            return true;
        }
        match (self.value(), other.value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for LazyVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            LazyState::Materialized(value) => f.debug_tuple("LazyVector").field(value).finish(),
            LazyState::Unmaterialized(_) => f
                .debug_struct("LazyVector")
                .field("len", &self.len)
                .field("materialized", &false)
                .finish(),
        }
    }
}
