use crate::{common::*, config::ValueRange};

/// Decodes an image file into a `[3, height, width]` float tensor in `range`.
///
/// Pixel values are divided by `norm_val`; values above 255 read the image
/// with 16-bit precision.
pub fn read_frame<P>(path: P, norm_val: f64, range: ValueRange) -> Fallible<Tensor>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let image = ImageReader::open(path)
        .with_context(|| format!("unable to open frame {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("unable to decode frame {}", path.display()))?;

    let (width, height, pixels) = if norm_val > 255.0 {
        let image = image.to_rgb16();
        let (width, height) = image.dimensions();
        let pixels = image
            .into_raw()
            .into_iter()
            .map(|value| (value as f64 / norm_val) as f32)
            .collect::<Vec<_>>();
        (width, height, pixels)
    } else {
        let image = image.to_rgb8();
        let (width, height) = image.dimensions();
        let pixels = image
            .into_raw()
            .into_iter()
            .map(|value| (value as f64 / norm_val) as f32)
            .collect::<Vec<_>>();
        (width, height, pixels)
    };

    let unit = Tensor::of_slice(&pixels)
        .view([height as i64, width as i64, 3])
        .permute(&[2, 0, 1]); // channel last to channel first
    Ok(range.from_unit(&unit.contiguous()))
}

/// Writes a `[3, height, width]` (or `[1, 3, height, width]`) tensor with
/// values in [0, 1] as an 8-bit RGB image.
pub fn save_frame<P>(frame: &Tensor, path: P) -> Fallible<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let frame = match frame.dim() {
        4 => frame.select(0, 0),
        3 => frame.shallow_clone(),
        dim => {
            return Err(DeblurError::dimension(format!(
                "expect a 3 or 4 dimensional frame, got {} dimensions",
                dim
            ))
            .into())
        }
    };
    let (channels, height, width) = frame.size3()?;
    if channels != 3 {
        return Err(DeblurError::dimension(format!(
            "expect 3 color channels, got {}",
            channels
        ))
        .into());
    }

    let bytes = tch::no_grad(|| {
        (frame.to_device(Device::Cpu).clamp_min(0.0).clamp_max(1.0) * 255.0)
            .round()
            .to_kind(Kind::Uint8)
            .permute(&[1, 2, 0])
            .contiguous()
    });
    let mut buf = vec![0_u8; bytes.numel()];
    let len = buf.len();
    bytes.copy_data(&mut buf, len);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let image: RgbImage = ImageBuffer::from_raw(width as u32, height as u32, buf)
        .ok_or_else(|| format_err!("pixel buffer does not fit {}x{}", width, height))?;
    image
        .save(path)
        .with_context(|| format!("unable to write {}", path.display()))?;
    Ok(())
}
