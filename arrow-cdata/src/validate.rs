//! Structural validation of an array tree against its schema.

use crate::array::ArrayView;
use crate::error::{Error, Result, ValidationError};
use crate::layout::{BufferKind, ChildCount, Layout};
use crate::schema::SchemaView;

/// Checks buffer counts, child counts and dictionary presence recursively.
///
/// Values are never inspected; a passing array may still hold bad offsets.
pub fn validate(array: ArrayView<'_>, schema: SchemaView<'_>) -> Result<()> {
    validate_node(array, schema, "root")
}

fn validate_node(array: ArrayView<'_>, schema: SchemaView<'_>, path: &str) -> Result<()> {
    if array.is_released() {
        return Err(ValidationError::new(path, "array has been released").into());
    }
    if schema.is_released() {
        return Err(ValidationError::new(path, "schema has been released").into());
    }
    if array.length() < 0 || array.offset() < 0 || array.null_count() < -1 {
        return Err(ValidationError::new(
            path,
            format!(
                "invalid length/offset/null_count {}/{}/{}",
                array.length(),
                array.offset(),
                array.null_count()
            ),
        )
        .into());
    }

    let data_type = schema.data_type().map_err(|e| match e {
        Error::InvalidFormat { format, message } => {
            Error::from(ValidationError::new(path, format!("format '{format}': {message}")))
        }
        other => other,
    })?;
    let layout = Layout::for_type(&data_type);

    if array.n_buffers() != layout.n_buffers() {
        return Err(ValidationError::count(
            path,
            "buffers",
            layout.n_buffers() as i64,
            array.n_buffers() as i64,
        )
        .into());
    }
    check_buffers(array, &layout, path)?;

    let expected_children = match layout.children {
        ChildCount::Exactly(n) => {
            if schema.n_children() != n {
                return Err(ValidationError::new(
                    path,
                    format!(
                        "schema declares {} children but its type needs {n}",
                        schema.n_children()
                    ),
                )
                .into());
            }
            n
        }
        ChildCount::FromSchema => schema.n_children(),
    };
    if array.n_children() != expected_children {
        return Err(ValidationError::count(
            path,
            "children",
            expected_children as i64,
            array.n_children() as i64,
        )
        .into());
    }
    for (i, (child, child_schema)) in array.children().zip(schema.children()).enumerate() {
        validate_node(child, child_schema, &format!("{path}.children[{i}]"))?;
    }

    match (array.dictionary(), schema.dictionary()) {
        (Some(dict), Some(dict_schema)) => {
            validate_node(dict, dict_schema, &format!("{path}.dictionary"))
        }
        (None, None) => Ok(()),
        (None, Some(_)) => Err(ValidationError::new(
            path,
            "schema has a dictionary but the array does not",
        )
        .into()),
        (Some(_), None) => Err(ValidationError::new(
            path,
            "array has a dictionary but the schema does not",
        )
        .into()),
    }
}

fn check_buffers(array: ArrayView<'_>, layout: &Layout, path: &str) -> Result<()> {
    let populated = array.length() > 0;
    for (i, kind) in layout.buffers.iter().enumerate() {
        let missing = array.buffer(i).is_null();
        let required = match kind {
            // A null count of -1 means "unknown"; a null bitmap then means "no nulls".
            BufferKind::Validity => array.null_count() > 0,
            // Empty variable-length data may legitimately be absent.
            BufferKind::Data => false,
            BufferKind::Fixed { .. }
            | BufferKind::Offsets32
            | BufferKind::Offsets64
            | BufferKind::TypeIds
            | BufferKind::UnionOffsets => populated,
        };
        if required && missing {
            return Err(ValidationError::new(
                format!("{path}.buffers[{i}]"),
                format!("{kind:?} buffer is required but null"),
            )
            .into());
        }
    }
    Ok(())
}
