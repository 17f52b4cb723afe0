use ndarray::Array2;

use crate::error::{Error, Result};

/// Widen an 8-bit grayscale pixel buffer to a working float image.
///
/// The reference implementation has two co-existing detection paths
/// (byte-direct and widened-float) that produce different star counts;
/// this crate implements only the widened-float path, matching the
/// reference's own documented behaviour. Each output pixel equals the
/// numeric value of the corresponding input byte verbatim — no
/// normalisation, no rescaling to `[0,1]`.
pub fn widen_u8(pixels: &[u8], width: usize, height: usize) -> Result<Array2<f32>> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!(
            "image dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    if pixels.len() != width * height {
        return Err(Error::InvalidInput(format!(
            "pixel buffer length {} does not match {}x{} = {}",
            pixels.len(),
            width,
            height,
            width * height
        )));
    }

    let data: Vec<f32> = pixels.iter().map(|&b| b as f32).collect();
    Array2::from_shape_vec((height, width), data)
        .map_err(|e| Error::AllocationFailure(e.to_string()))
}

/// Block-average an image by an integer downsample factor `d`.
/// `d` must be one of {1,2,3,4}; `d == 1`
/// returns a clone with no averaging. Trailing rows/columns that don't fill
/// a full `d x d` block are dropped, matching a simple block-mean reducer.
pub fn downsample(image: &Array2<f32>, d: usize) -> Result<Array2<f32>> {
    if !(1..=4).contains(&d) {
        return Err(Error::InvalidInput(format!(
            "downsample factor must be in 1..=4, got {}",
            d
        )));
    }
    if d == 1 {
        return Ok(image.clone());
    }

    let (h, w) = image.dim();
    let out_h = h / d;
    let out_w = w / d;
    if out_h == 0 || out_w == 0 {
        return Err(Error::InvalidInput(format!(
            "image {}x{} too small to downsample by {}",
            w, h, d
        )));
    }

    let mut out = Array2::<f32>::zeros((out_h, out_w));
    let norm = (d * d) as f32;
    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut sum = 0.0f32;
            for dy in 0..d {
                for dx in 0..d {
                    sum += image[[oy * d + dy, ox * d + dx]];
                }
            }
            out[[oy, ox]] = sum / norm;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_preserves_values_verbatim() {
        let pixels = [0u8, 1, 128, 255];
        let img = widen_u8(&pixels, 2, 2).unwrap();
        assert_eq!(img[[0, 0]], 0.0);
        assert_eq!(img[[0, 1]], 1.0);
        assert_eq!(img[[1, 0]], 128.0);
        assert_eq!(img[[1, 1]], 255.0);
    }

    #[test]
    fn widen_rejects_mismatched_buffer() {
        let pixels = [0u8, 1, 2];
        assert!(matches!(widen_u8(&pixels, 2, 2), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn downsample_by_one_is_identity() {
        let img = Array2::from_shape_vec((4, 4), (0..16).map(|v| v as f32).collect()).unwrap();
        let out = downsample(&img, 1).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn downsample_by_two_averages_blocks() {
        let img = Array2::from_shape_vec(
            (2, 2),
            vec![0.0f32, 2.0, 4.0, 6.0],
        )
        .unwrap();
        let out = downsample(&img, 2).unwrap();
        assert_eq!(out.dim(), (1, 1));
        assert!((out[[0, 0]] - 3.0).abs() < 1e-6);
    }
}
