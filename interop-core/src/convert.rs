//! Type-directed conversion of host-resident arrays into native vectors.

use std::ptr;

use arrow_cdata::format::type_name;
use arrow_cdata::{ArrayView, Error as CdataError, SchemaView};
use arrow_schema::DataType;

use crate::error::{InteropError, Result};
use crate::lazy::{LazySource, LazyVector, PathStep};

/// A fully converted column. Nulls are `None`.
///
/// Struct fields stay lazy: each is converted the first time it is read.
#[derive(Debug, Clone, PartialEq)]
pub enum HostVector {
    Null(usize),
    Boolean(Vec<Option<bool>>),
    /// Signed integers, narrower unsigned integers and integer-backed
    /// temporal types, widened to `i64`.
    Int(Vec<Option<i64>>),
    UInt(Vec<Option<u64>>),
    Float(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Binary(Vec<Option<Vec<u8>>>),
    List(Vec<Option<HostVector>>),
    Struct {
        len: usize,
        fields: Vec<(String, LazyVector)>,
        validity: Option<Vec<bool>>,
    },
}

impl HostVector {
    pub fn len(&self) -> usize {
        match self {
            HostVector::Null(n) => *n,
            HostVector::Boolean(v) => v.len(),
            HostVector::Int(v) => v.len(),
            HostVector::UInt(v) => v.len(),
            HostVector::Float(v) => v.len(),
            HostVector::Utf8(v) => v.len(),
            HostVector::Binary(v) => v.len(),
            HostVector::List(v) => v.len(),
            HostVector::Struct { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field(&self, name: &str) -> Option<&LazyVector> {
        match self {
            HostVector::Struct { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Forces every nested lazy vector.
    pub(crate) fn materialize_nested(&self) -> Result<()> {
        match self {
            HostVector::Struct { fields, .. } => {
                for (_, field) in fields {
                    field.force_materialize(true)?;
                }
            }
            HostVector::List(items) => {
                for item in items.iter().flatten() {
                    item.materialize_nested()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Gathers `indices` out of this vector; `None` yields a null.
    fn take(&self, indices: &[Option<usize>]) -> Result<HostVector> {
        fn gather<T: Clone>(
            values: &[Option<T>],
            indices: &[Option<usize>],
        ) -> Result<Vec<Option<T>>> {
            indices
                .iter()
                .map(|idx| match idx {
                    None => Ok(None),
                    Some(i) => values.get(*i).cloned().ok_or_else(|| {
                        InteropError::Cdata(CdataError::InvalidArgument(format!(
                            "dictionary key {i} out of range for {} values",
                            values.len()
                        )))
                    }),
                })
                .collect()
        }
        Ok(match self {
            HostVector::Null(_) => HostVector::Null(indices.len()),
            HostVector::Boolean(v) => HostVector::Boolean(gather(v, indices)?),
            HostVector::Int(v) => HostVector::Int(gather(v, indices)?),
            HostVector::UInt(v) => HostVector::UInt(gather(v, indices)?),
            HostVector::Float(v) => HostVector::Float(gather(v, indices)?),
            HostVector::Utf8(v) => HostVector::Utf8(gather(v, indices)?),
            HostVector::Binary(v) => HostVector::Binary(gather(v, indices)?),
            HostVector::List(v) => HostVector::List(gather(v, indices)?),
            HostVector::Struct { .. } => {
                return Err(InteropError::UnsupportedType("dictionary(struct)".into()))
            }
        })
    }
}

/// Turns the array window behind a [`LazySource`] into a [`HostVector`].
pub trait Converter: Send + Sync {
    fn convert(&self, source: &LazySource) -> Result<HostVector>;
}

/// Reads host buffers directly, per the array's layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostConverter;

impl Converter for HostConverter {
    fn convert(&self, source: &LazySource) -> Result<HostVector> {
        let (array, schema) = source.node()?;
        convert_node(source, source.path(), array, schema, source.start(), source.len())
    }
}

unsafe fn read<T: Copy>(buffer: *const u8, index: usize) -> T {
    ptr::read_unaligned((buffer as *const T).add(index))
}

fn bit(buffer: *const u8, index: usize) -> bool {
    unsafe { *buffer.add(index / 8) >> (index % 8) & 1 == 1 }
}

struct Node<'a> {
    array: ArrayView<'a>,
    /// Absolute index of the first element in the window.
    base: usize,
    len: usize,
    has_validity: bool,
}

impl Node<'_> {
    fn is_valid(&self, i: usize) -> bool {
        if !self.has_validity {
            return true;
        }
        let validity = self.array.buffer(0);
        validity.is_null() || bit(validity, self.base + i)
    }

    fn values<T: Copy, U>(&self, map: impl Fn(T) -> U) -> Vec<Option<U>> {
        let data = self.array.buffer(1);
        (0..self.len)
            .map(|i| {
                self.is_valid(i)
                    .then(|| map(unsafe { read::<T>(data, self.base + i) }))
            })
            .collect()
    }

    /// `(start, end)` of element `i` in an offsets buffer of `O`.
    ///
    /// Negative or decreasing offsets are an error.
    fn range<O: Copy + Into<i64>>(&self, i: usize) -> Result<(usize, usize)> {
        let offsets = self.array.buffer(1);
        let start: i64 = unsafe { read::<O>(offsets, self.base + i) }.into();
        let end: i64 = unsafe { read::<O>(offsets, self.base + i + 1) }.into();
        match (usize::try_from(start), usize::try_from(end)) {
            (Ok(s), Ok(e)) if s <= e => Ok((s, e)),
            _ => Err(InteropError::Cdata(CdataError::InvalidArgument(format!(
                "invalid offsets {start}..{end} at element {i}"
            )))),
        }
    }

    fn bytes<O: Copy + Into<i64>>(&self) -> Result<Vec<Option<Vec<u8>>>> {
        let data = self.array.buffer(2);
        (0..self.len)
            .map(|i| {
                if !self.is_valid(i) {
                    return Ok(None);
                }
                let (start, end) = self.range::<O>(i)?;
                if end == start || data.is_null() {
                    return Ok(Some(Vec::new()));
                }
                let bytes = unsafe { std::slice::from_raw_parts(data.add(start), end - start) };
                Ok(Some(bytes.to_vec()))
            })
            .collect()
    }
}

fn strings(bytes: Vec<Option<Vec<u8>>>) -> Result<Vec<Option<String>>> {
    bytes
        .into_iter()
        .map(|b| {
            b.map(|b| {
                String::from_utf8(b).map_err(|e| {
                    InteropError::Cdata(CdataError::InvalidArgument(format!("invalid utf-8: {e}")))
                })
            })
            .transpose()
        })
        .collect()
}

fn convert_node(
    source: &LazySource,
    path: &[PathStep],
    array: ArrayView<'_>,
    schema: SchemaView<'_>,
    start: usize,
    len: usize,
) -> Result<HostVector> {
    let data_type = schema.data_type()?;
    let node = Node {
        array,
        base: array.offset() as usize + start,
        len,
        has_validity: arrow_cdata::Layout::for_type(&data_type).has_validity(),
    };

    let vector = match &data_type {
        DataType::Null => HostVector::Null(len),
        DataType::Boolean => {
            let data = array.buffer(1);
            HostVector::Boolean(
                (0..len)
                    .map(|i| node.is_valid(i).then(|| bit(data, node.base + i)))
                    .collect(),
            )
        }
        DataType::Int8 => HostVector::Int(node.values(|v: i8| v as i64)),
        DataType::Int16 => HostVector::Int(node.values(|v: i16| v as i64)),
        DataType::Int32 | DataType::Date32 | DataType::Time32(_) => {
            HostVector::Int(node.values(|v: i32| v as i64))
        }
        DataType::Int64
        | DataType::Date64
        | DataType::Time64(_)
        | DataType::Timestamp(_, _)
        | DataType::Duration(_) => {
            HostVector::Int(node.values(|v: i64| v))
        }
        DataType::UInt8 => HostVector::Int(node.values(|v: u8| v as i64)),
        DataType::UInt16 => HostVector::Int(node.values(|v: u16| v as i64)),
        DataType::UInt32 => HostVector::Int(node.values(|v: u32| v as i64)),
        DataType::UInt64 => HostVector::UInt(node.values(|v: u64| v)),
        DataType::Float32 => HostVector::Float(node.values(|v: f32| v as f64)),
        DataType::Float64 => HostVector::Float(node.values(|v: f64| v)),
        DataType::Utf8 => HostVector::Utf8(strings(node.bytes::<i32>()?)?),
        DataType::LargeUtf8 => HostVector::Utf8(strings(node.bytes::<i64>()?)?),
        DataType::Binary => HostVector::Binary(node.bytes::<i32>()?),
        DataType::LargeBinary => HostVector::Binary(node.bytes::<i64>()?),
        DataType::List(_) | DataType::LargeList(_) => {
            let large = matches!(data_type, DataType::LargeList(_));
            let items_path = child_path(path, PathStep::Child(0));
            let (child, child_schema) = (array.child(0), schema.child(0));
            let items = (0..len)
                .map(|i| {
                    if !node.is_valid(i) {
                        return Ok(None);
                    }
                    let (start, end) = if large {
                        node.range::<i64>(i)?
                    } else {
                        node.range::<i32>(i)?
                    };
                    convert_node(source, &items_path, child, child_schema, start, end - start)
                        .map(Some)
                })
                .collect::<Result<Vec<_>>>()?;
            HostVector::List(items)
        }
        DataType::FixedSizeList(_, size) => {
            let size = (*size).max(0) as usize;
            let items_path = child_path(path, PathStep::Child(0));
            let (child, child_schema) = (array.child(0), schema.child(0));
            let items = (0..len)
                .map(|i| {
                    if !node.is_valid(i) {
                        return Ok(None);
                    }
                    let start = (node.base + i) * size;
                    convert_node(source, &items_path, child, child_schema, start, size).map(Some)
                })
                .collect::<Result<Vec<_>>>()?;
            HostVector::List(items)
        }
        DataType::Struct(_) => {
            let fields = schema
                .children()
                .enumerate()
                .map(|(i, child)| {
                    let name = child.name().unwrap_or_default().to_string();
                    let step = child_path(path, PathStep::Child(i));
                    (name, LazyVector::from_source(source.relocate(step, node.base, len)))
                })
                .collect();
            let validity = (!array.buffer(0).is_null())
                .then(|| (0..len).map(|i| node.is_valid(i)).collect());
            HostVector::Struct {
                len,
                fields,
                validity,
            }
        }
        DataType::Dictionary(key, _) => {
            let keys: Vec<Option<i64>> = match key.as_ref() {
                DataType::Int8 => node.values(|v: i8| v as i64),
                DataType::Int16 => node.values(|v: i16| v as i64),
                DataType::Int32 => node.values(|v: i32| v as i64),
                DataType::Int64 => node.values(|v: i64| v),
                DataType::UInt8 => node.values(|v: u8| v as i64),
                DataType::UInt16 => node.values(|v: u16| v as i64),
                DataType::UInt32 => node.values(|v: u32| v as i64),
                // Keys past i64::MAX are out of range for any dictionary.
                DataType::UInt64 => node.values(|v: u64| i64::try_from(v).unwrap_or(i64::MAX)),
                other => return Err(InteropError::UnsupportedType(type_name(other))),
            };
            let (dict, dict_schema) = match (array.dictionary(), schema.dictionary()) {
                (Some(d), Some(s)) => (d, s),
                _ => return Err(CdataError::Released("dictionary").into()),
            };
            let dict_path = child_path(path, PathStep::Dictionary);
            let values = convert_node(
                source,
                &dict_path,
                dict,
                dict_schema,
                0,
                dict.length() as usize,
            )?;
            let indices = keys
                .into_iter()
                .map(|k| {
                    k.map(|k| {
                        usize::try_from(k).map_err(|_| {
                            InteropError::Cdata(CdataError::InvalidArgument(format!(
                                "dictionary key {k} is negative"
                            )))
                        })
                    })
                    .transpose()
                })
                .collect::<Result<Vec<Option<usize>>>>()?;
            values.take(&indices)?
        }
        other => return Err(InteropError::UnsupportedType(type_name(other))),
    };
    Ok(vector)
}

fn child_path(path: &[PathStep], step: PathStep) -> Vec<PathStep> {
    let mut out = Vec::with_capacity(path.len() + 1);
    out.extend_from_slice(path);
    out.push(step);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{
        builder::{Int64Builder, ListBuilder, StringDictionaryBuilder},
        types::Int16Type,
        Array, ArrayRef, BooleanArray, Int32Array, StringArray, StructArray, UInt64Array,
    };
    use arrow_cdata::{ArrayData, ArrayHandle, Schema, SchemaHandle};
    use arrow_schema::Field;
    use std::sync::Arc;

    fn lazy(array: &dyn Array) -> LazyVector {
        let schema = Schema::from_field(&Field::new("", array.data_type().clone(), true)).unwrap();
        let handle = ArrayHandle::new(ArrayData::from_arrow(array).unwrap()).unwrap();
        LazyVector::new(handle, SchemaHandle::new(schema).unwrap()).unwrap()
    }

    fn value(array: &dyn Array) -> HostVector {
        (*lazy(array).value().unwrap()).clone()
    }

    #[test]
    fn primitives() {
        assert_eq!(
            value(&Int32Array::from(vec![Some(1), None, Some(-3)])),
            HostVector::Int(vec![Some(1), None, Some(-3)])
        );
        assert_eq!(
            value(&UInt64Array::from(vec![u64::MAX])),
            HostVector::UInt(vec![Some(u64::MAX)])
        );
        assert_eq!(
            value(&BooleanArray::from(vec![Some(true), None, Some(false)])),
            HostVector::Boolean(vec![Some(true), None, Some(false)])
        );
    }

    #[test]
    fn sliced_strings() {
        let strings = StringArray::from(vec![Some("a"), None, Some("ccc"), Some("")]);
        assert_eq!(
            value(&strings.slice(1, 3)),
            HostVector::Utf8(vec![None, Some("ccc".into()), Some(String::new())])
        );
    }

    #[test]
    fn lists() {
        let mut builder = ListBuilder::new(Int64Builder::new());
        builder.values().append_value(1);
        builder.values().append_value(2);
        builder.append(true);
        builder.append(false);
        builder.values().append_value(3);
        builder.append(true);
        let list = builder.finish();
        assert_eq!(
            value(&list),
            HostVector::List(vec![
                Some(HostVector::Int(vec![Some(1), Some(2)])),
                None,
                Some(HostVector::Int(vec![Some(3)])),
            ])
        );
    }

    #[test]
    fn struct_fields_are_lazy() {
        let ids: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3]));
        let names: ArrayRef = Arc::new(StringArray::from(vec!["x", "y", "z"]));
        let array = StructArray::from(vec![
            (Arc::new(Field::new("id", arrow_schema::DataType::Int32, false)), ids),
            (Arc::new(Field::new("name", arrow_schema::DataType::Utf8, false)), names),
        ]);
        let sliced = array.slice(1, 2);
        let vector = lazy(&sliced);
        let value = vector.value().unwrap();
        let name = value.field("name").unwrap();
        assert!(!name.is_materialized());
        assert_eq!(name.len(), 2);
        assert_eq!(
            *name.value().unwrap(),
            HostVector::Utf8(vec![Some("y".into()), Some("z".into())])
        );
        assert!(!value.field("id").unwrap().is_materialized());
    }

    #[test]
    fn dictionary_is_decoded() {
        let mut builder = StringDictionaryBuilder::<Int16Type>::new();
        builder.append_value("red");
        builder.append_null();
        builder.append_value("blue");
        builder.append_value("red");
        let dict = builder.finish();
        assert_eq!(
            value(&dict),
            HostVector::Utf8(vec![
                Some("red".into()),
                None,
                Some("blue".into()),
                Some("red".into()),
            ])
        );
    }

    fn host_value(data: ArrayData, schema: Schema) -> Result<HostVector> {
        let vector = LazyVector::new(ArrayHandle::new(data)?, SchemaHandle::new(schema)?)?;
        let value = vector.value()?;
        Ok((*value).clone())
    }

    #[test]
    fn negative_dictionary_key_is_an_error() {
        let dict = || {
            ArrayData::from_strings(&[
                Some("x"),
                Some("y"),
                Some("z"),
                Some("w"),
                Some("v"),
                Some("q"),
            ])
            .unwrap()
        };
        let schema = || Schema::new("c").with_dictionary(Schema::new("u"));

        let keys = ArrayData::from_values(&[-1i8, 5]).with_dictionary(dict());
        match host_value(keys, schema()) {
            Err(InteropError::Cdata(CdataError::InvalidArgument(msg))) => {
                assert!(msg.contains("-1"), "{msg}")
            }
            other => panic!("expected a key error, got {other:?}"),
        }

        let keys = ArrayData::from_values(&[0i8, 5]).with_dictionary(dict());
        assert_eq!(
            host_value(keys, schema()).unwrap(),
            HostVector::Utf8(vec![Some("x".into()), Some("q".into())])
        );

        let keys = ArrayData::from_values(&[u64::MAX]).with_dictionary(dict());
        let schema = Schema::new("L").with_dictionary(Schema::new("u"));
        assert!(host_value(keys, schema).is_err());
    }

    #[test]
    fn decreasing_offsets_are_an_error() {
        let data = ArrayData::new(2).with_buffers(vec![
            arrow_cdata::Buffer::null(),
            arrow_cdata::Buffer::from_values(&[0i32, 3, 1]),
            arrow_cdata::Buffer::from_vec(b"abc".to_vec()),
        ]);
        assert!(matches!(
            host_value(data, Schema::new("u")),
            Err(InteropError::Cdata(CdataError::InvalidArgument(_)))
        ));

        let list = ArrayData::new(1)
            .with_buffers(vec![
                arrow_cdata::Buffer::null(),
                arrow_cdata::Buffer::from_values(&[-2i32, 1]),
            ])
            .with_children(vec![ArrayData::from_values(&[7i64])]);
        let schema = Schema::new("+l").with_children(vec![Schema::new("l")]);
        assert!(host_value(list, schema).is_err());
    }

    #[test]
    fn unsupported_type_is_reported() {
        let data = ArrayData::new(0).with_buffers(vec![
            arrow_cdata::Buffer::null(),
            arrow_cdata::Buffer::null(),
        ]);
        let schema = SchemaHandle::new(Schema::new("e")).unwrap();
        let vector = LazyVector::new(ArrayHandle::new(data).unwrap(), schema).unwrap();
        match vector.value() {
            Err(InteropError::UnsupportedType(name)) => assert_eq!(name, "half_float"),
            other => panic!("expected unsupported type, got {other:?}"),
        }
        assert!(!vector.is_materialized());
    }
}
