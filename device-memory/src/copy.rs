//! Moving a device array from one memory space to another.

use arrow_cdata::{
    ArrayData, ArrayHandle, ArrayView, Buffer, BufferKind, Error, Layout, Result, SchemaView,
};
use tracing::{debug, instrument};

use crate::device::{buffer_init, BufferSource, Device, DeviceRef};
use crate::device_array::DeviceArray;

/// Copies `src` onto `dst`.
///
/// The source is synchronized and validated against `schema`, every buffer
/// is copied top-down (children and dictionary included), and the result is
/// tagged with `dst` and an event recorded after the last copy. The new
/// array owns exactly the destination allocations. On failure, every buffer
/// allocated so far is dropped before the error is returned.
#[instrument(skip_all, fields(src = %src.device_id(), dst = %dst.id()))]
pub fn copy_device_array(
    src: &DeviceArray,
    schema: &arrow_cdata::SchemaHandle,
    dst: &DeviceRef,
) -> Result<DeviceArray> {
    src.synchronize()?;
    let view = src.view()?;
    let schema = schema.view()?;
    arrow_cdata::validate(view, schema)?;

    let data = copy_node(src.device().as_ref(), dst.as_ref(), view, schema)?;
    let array = ArrayHandle::new(data)?;
    let event = dst.record_event()?;
    debug!(length = array.length(), "device copy issued");
    Ok(DeviceArray::new(dst.clone(), array, Some(event)))
}

fn copy_node(
    src: &dyn Device,
    dst: &dyn Device,
    view: ArrayView<'_>,
    schema: SchemaView<'_>,
) -> Result<ArrayData> {
    let layout = Layout::for_type(&schema.data_type()?);
    let end = view
        .offset()
        .checked_add(view.length())
        .and_then(|end| usize::try_from(end).ok())
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "offset {} + length {} overflows",
                view.offset(),
                view.length()
            ))
        })?;

    let mut buffers = Vec::with_capacity(layout.n_buffers());
    for (i, kind) in layout.buffers.iter().enumerate() {
        let ptr = view.buffer(i);
        if ptr.is_null() {
            buffers.push(Buffer::null());
            continue;
        }
        let size = match Layout::fixed_buffer_size(*kind, end)? {
            Some(size) => size,
            None => data_size(src, view, &layout, end)?,
        };
        buffers.push(buffer_init(dst, size, Some(BufferSource::new(src, ptr, size)))?);
    }

    let children = view
        .children()
        .zip(schema.children())
        .map(|(child, child_schema)| copy_node(src, dst, child, child_schema))
        .collect::<Result<Vec<_>>>()?;
    let dictionary = match (view.dictionary(), schema.dictionary()) {
        (Some(dict), Some(dict_schema)) => Some(copy_node(src, dst, dict, dict_schema)?),
        _ => None,
    };

    let mut data = ArrayData::new(view.length())
        .with_null_count(view.null_count())
        .with_offset(view.offset())
        .with_buffers(buffers)
        .with_children(children);
    if let Some(dictionary) = dictionary {
        data = data.with_dictionary(dictionary);
    }
    Ok(data)
}

/// Size of a variable-length data buffer: the last offset, read through the
/// source device.
fn data_size(src: &dyn Device, view: ArrayView<'_>, layout: &Layout, end: usize) -> Result<usize> {
    let Some(offsets_at) = layout
        .buffers
        .iter()
        .position(|k| matches!(k, BufferKind::Offsets32 | BufferKind::Offsets64))
    else {
        return Ok(0);
    };
    let offsets = view.buffer(offsets_at);
    if offsets.is_null() {
        return Ok(0);
    }
    let size = match layout.buffers[offsets_at] {
        BufferKind::Offsets32 => {
            let mut last = [0u8; 4];
            src.read_to_host(unsafe { offsets.add(end * 4) }, &mut last)?;
            i32::from_ne_bytes(last).max(0) as usize
        }
        _ => {
            let mut last = [0u8; 8];
            src.read_to_host(unsafe { offsets.add(end * 8) }, &mut last)?;
            i64::from_ne_bytes(last).max(0) as usize
        }
    };
    Ok(size)
}
