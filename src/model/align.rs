use crate::common::*;

/// The largest `(height, width)` not exceeding the input that is a multiple
/// of `multiple` in both dimensions.
pub fn aligned_size(height: i64, width: i64, multiple: i64) -> (i64, i64) {
    (height - height % multiple, width - width % multiple)
}

/// Crops the last two dimensions of `tensor` to `(height, width)` from the
/// top-left corner.
pub fn crop_to(tensor: &Tensor, height: i64, width: i64) -> Tensor {
    let dim = tensor.dim() as i64;
    tensor.narrow(dim - 2, 0, height).narrow(dim - 1, 0, width)
}

/// Crops both spatial dimensions down to a multiple of `multiple`.
pub fn refine_image(tensor: &Tensor, multiple: i64) -> Tensor {
    let size = tensor.size();
    let (height, width) = (size[size.len() - 2], size[size.len() - 1]);
    let (height, width) = aligned_size(height, width, multiple);
    crop_to(tensor, height, width)
}

/// Zero-pads a `[batch, 2, h, w]` displacement field at the bottom and right
/// up to `(height, width)`.
pub fn pad_field(field: &Tensor, height: i64, width: i64) -> Fallible<Tensor> {
    let (batch, channels, field_h, field_w) = field.size4().map_err(|_| {
        DeblurError::dimension(format!("expect a 4-D field, got {:?}", field.size()))
    })?;
    if channels != 2 || field_h > height || field_w > width {
        return Err(DeblurError::dimension(format!(
            "cannot pad field {:?} to {}x{}",
            [batch, channels, field_h, field_w],
            height,
            width
        ))
        .into());
    }

    if field_h == height && field_w == width {
        return Ok(field.shallow_clone());
    }
    Ok(field.constant_pad_nd(&[0, width - field_w, 0, height - field_h]))
}
