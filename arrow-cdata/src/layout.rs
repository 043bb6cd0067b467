//! Physical buffer layout implied by a data type.

use arrow_schema::{DataType, UnionMode};

use crate::error::{Error, Result};

/// Role of one buffer in an array's `buffers` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// LSB-first validity bitmap; may be null when there are no nulls.
    Validity,
    /// Fixed-width values, `bits` per element (1 for booleans).
    Fixed { bits: usize },
    Offsets32,
    Offsets64,
    /// Variable-length bytes, sized by the last offset.
    Data,
    /// Union type ids, one `i8` per element.
    TypeIds,
    /// Dense union offsets, one `i32` per element.
    UnionOffsets,
}

/// Expected number of children for a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildCount {
    Exactly(usize),
    /// Struct and union: whatever the schema declares.
    FromSchema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub buffers: Vec<BufferKind>,
    pub children: ChildCount,
}

impl Layout {
    pub fn for_type(dt: &DataType) -> Self {
        use BufferKind::*;
        let (buffers, children) = match dt {
            DataType::Null => (vec![], ChildCount::Exactly(0)),
            DataType::Boolean => (vec![Validity, Fixed { bits: 1 }], ChildCount::Exactly(0)),
            DataType::Binary | DataType::Utf8 => {
                (vec![Validity, Offsets32, Data], ChildCount::Exactly(0))
            }
            DataType::LargeBinary | DataType::LargeUtf8 => {
                (vec![Validity, Offsets64, Data], ChildCount::Exactly(0))
            }
            DataType::FixedSizeBinary(n) => {
                // Non-positive widths never parse; treat them as zero-width here.
                let bits = usize::try_from(*n)
                    .ok()
                    .and_then(|n| n.checked_mul(8))
                    .unwrap_or(0);
                (vec![Validity, Fixed { bits }], ChildCount::Exactly(0))
            }
            DataType::List(_) | DataType::Map(_, _) => {
                (vec![Validity, Offsets32], ChildCount::Exactly(1))
            }
            DataType::LargeList(_) => (vec![Validity, Offsets64], ChildCount::Exactly(1)),
            DataType::FixedSizeList(_, _) => (vec![Validity], ChildCount::Exactly(1)),
            DataType::Struct(_) => (vec![Validity], ChildCount::FromSchema),
            DataType::Union(_, UnionMode::Dense) => {
                (vec![TypeIds, UnionOffsets], ChildCount::FromSchema)
            }
            DataType::Union(_, UnionMode::Sparse) => (vec![TypeIds], ChildCount::FromSchema),
            DataType::RunEndEncoded(_, _) => (vec![], ChildCount::Exactly(2)),
            DataType::Dictionary(key, _) => return Self::for_type(key),
            other => {
                let bytes = other.primitive_width().unwrap_or(0);
                (vec![Validity, Fixed { bits: bytes * 8 }], ChildCount::Exactly(0))
            }
        };
        Self { buffers, children }
    }

    pub fn n_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn has_validity(&self) -> bool {
        self.buffers.first() == Some(&BufferKind::Validity)
    }

    /// Byte size of a buffer covering `logical_end` elements (offset + length).
    ///
    /// Returns `None` for [`BufferKind::Data`], which depends on buffer contents,
    /// and an error when the size does not fit `usize`.
    pub fn fixed_buffer_size(kind: BufferKind, logical_end: usize) -> Result<Option<usize>> {
        let size = match kind {
            BufferKind::Validity => Some(logical_end.div_ceil(8)),
            BufferKind::Fixed { bits } => logical_end.checked_mul(bits).map(|b| b.div_ceil(8)),
            BufferKind::Offsets32 => logical_end.checked_add(1).and_then(|n| n.checked_mul(4)),
            BufferKind::Offsets64 => logical_end.checked_add(1).and_then(|n| n.checked_mul(8)),
            BufferKind::TypeIds => Some(logical_end),
            BufferKind::UnionOffsets => logical_end.checked_mul(4),
            BufferKind::Data => return Ok(None),
        };
        size.map(Some).ok_or_else(|| {
            Error::InvalidArgument(format!("{kind:?} buffer for {logical_end} elements overflows"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::Field;
    use std::sync::Arc;

    #[test]
    fn primitive_layouts() {
        let l = Layout::for_type(&DataType::Int32);
        assert_eq!(l.buffers, vec![BufferKind::Validity, BufferKind::Fixed { bits: 32 }]);
        assert!(l.has_validity());
        assert_eq!(Layout::for_type(&DataType::Null).n_buffers(), 0);
        assert_eq!(
            Layout::for_type(&DataType::Decimal128(10, 2)).buffers[1],
            BufferKind::Fixed { bits: 128 }
        );
    }

    #[test]
    fn nested_layouts() {
        let item = Arc::new(Field::new("item", DataType::Utf8, true));
        let l = Layout::for_type(&DataType::List(item));
        assert_eq!(l.n_buffers(), 2);
        assert_eq!(l.children, ChildCount::Exactly(1));
        let dict = DataType::Dictionary(Box::new(DataType::Int8), Box::new(DataType::Utf8));
        assert_eq!(Layout::for_type(&dict), Layout::for_type(&DataType::Int8));
    }

    #[test]
    fn buffer_sizes() {
        let size = |kind, end| Layout::fixed_buffer_size(kind, end).unwrap();
        assert_eq!(size(BufferKind::Validity, 9), Some(2));
        assert_eq!(size(BufferKind::Fixed { bits: 1 }, 3), Some(1));
        assert_eq!(size(BufferKind::Fixed { bits: 64 }, 3), Some(24));
        assert_eq!(size(BufferKind::Offsets32, 3), Some(16));
        assert_eq!(size(BufferKind::Offsets32, 0), Some(4));
        assert_eq!(size(BufferKind::Data, 3), None);
    }

    #[test]
    fn oversized_buffers_are_errors() {
        assert!(Layout::fixed_buffer_size(BufferKind::Offsets64, usize::MAX).is_err());
        assert!(Layout::fixed_buffer_size(BufferKind::Fixed { bits: 64 }, usize::MAX / 2).is_err());
        assert!(matches!(
            Layout::fixed_buffer_size(BufferKind::UnionOffsets, usize::MAX),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            Layout::fixed_buffer_size(BufferKind::Validity, usize::MAX).unwrap(),
            Some(usize::MAX.div_ceil(8))
        );
    }
}
