use image::RgbaImage;
use rayon::prelude::*;

use crate::error::{WarpError, WarpResult};
use crate::geometry::{Point, Quad, bilinear_sample};
use crate::state::{ResultSpec, SourceImage, WarpRequest, WarpResponse};

// Round-off from x / W * W can land a hair below an integer; flooring would
// then pick the previous texel.
const SNAP_EPS: f64 = 1e-7;

/// Resample the quad region of `source` into a `result`-sized RGBA8 buffer.
///
/// Each output pixel takes the nearest source texel at the bilinear position
/// for `u = x / W`, `v = y / H`. Positions outside the source clamp to the
/// edge texel.
pub fn warp(source: &SourceImage, quad: &Quad, result: ResultSpec) -> WarpResult<RgbaImage> {
    validate(quad, result)?;
    let row_len = result.width as usize * 4;
    let mut out = vec![0_u8; result.pixel_count() * 4];
    for (y, row) in out.chunks_exact_mut(row_len).enumerate() {
        warp_row(source, quad, result, y as u32, row);
    }
    into_image(result, out)
}

/// Same output as [`warp`], rows spread over the rayon pool.
pub fn warp_parallel(
    source: &SourceImage,
    quad: &Quad,
    result: ResultSpec,
) -> WarpResult<RgbaImage> {
    validate(quad, result)?;
    let row_len = result.width as usize * 4;
    let mut out = vec![0_u8; result.pixel_count() * 4];
    out.par_chunks_exact_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| warp_row(source, quad, result, y as u32, row));
    into_image(result, out)
}

/// Runs one dispatcher job, consuming the request and its source handle.
pub fn run_request(request: WarpRequest) -> WarpResult<WarpResponse> {
    let WarpRequest {
        id,
        quad,
        result,
        source,
    } = request;
    let image = warp(&source, &quad, result)?;
    Ok(WarpResponse { id, image })
}

fn validate(quad: &Quad, result: ResultSpec) -> WarpResult<()> {
    if !quad.is_finite() {
        return Err(WarpError::geometry(format!(
            "quad has non-finite corners: {quad:?}"
        )));
    }
    if result.width == 0 || result.height == 0 {
        return Err(WarpError::InvalidResultSize {
            width: result.width,
            height: result.height,
        });
    }
    Ok(())
}

fn into_image(result: ResultSpec, out: Vec<u8>) -> WarpResult<RgbaImage> {
    RgbaImage::from_raw(result.width, result.height, out)
        .ok_or_else(|| WarpError::image("result buffer does not match result size"))
}

fn warp_row(source: &SourceImage, quad: &Quad, result: ResultSpec, y: u32, row: &mut [u8]) {
    let src = source.as_raw();
    let src_w = source.width() as usize;
    let v = y as f64 / result.height as f64;
    for (x, px) in row.chunks_exact_mut(4).enumerate() {
        let u = x as f64 / result.width as f64;
        let (sx, sy) = source_texel(bilinear_sample(quad, u, v), source.width(), source.height());
        let idx = (sy * src_w + sx) * 4;
        px.copy_from_slice(&src[idx..idx + 4]);
    }
}

/// Floors a source-space position and clamps it onto the image.
pub fn source_texel(p: Point, width: u32, height: u32) -> (usize, usize) {
    let clamp = |v: f64, len: u32| (v + SNAP_EPS).floor().clamp(0.0, (len - 1) as f64) as usize;
    (clamp(p.x, width), clamp(p.y, height))
}
