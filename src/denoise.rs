// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Block-transform Wiener denoising.
//!
//! Produces the "clean" reference image the noise model measures raw
//! samples against. Each plane is processed in half-overlapped windowed
//! blocks: the low-frequency background comes from the flat-block finder's
//! plane fit, the residual is attenuated in the frequency domain against
//! the supplied noise PSD, and the overlap-add result is dithered back to
//! the source bit depth.

use crate::flat::FlatBlockFinder;
use crate::transform::BlockTransform;

use log::debug;
use std::f64::consts::PI;
use thiserror::Error;
use v_frame::pixel::{CastFromPrimitive, Pixel};
use v_frame::plane::Plane;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DenoiseError {
  /// Chroma planes must share the same horizontal and vertical decimation.
  #[error("anisotropic chroma subsampling is not supported")]
  UnsupportedSubsampling,
  /// Block sizes must be powers of two large enough to survive chroma
  /// decimation.
  #[error("unsupported denoising block size {0}")]
  UnsupportedBlockSize(usize),
}

/// Separable half-cosine window; with 50% overlap the squared window
/// overlap-adds to unity.
fn half_cos_window(block_size: usize) -> Vec<f64> {
  let mut window = vec![0.0; block_size * block_size];
  for y in 0..block_size {
    let cos_yd = ((0.5 + y as f64) * PI / block_size as f64 - PI / 2.0).cos();
    for x in 0..block_size {
      let cos_xd =
        ((0.5 + x as f64) * PI / block_size as f64 - PI / 2.0).cos();
      window[y * block_size + x] = cos_yd * cos_xd;
    }
  }
  window
}

fn pointwise_multiply(window: &[f64], values: &mut [f64]) {
  for (v, w) in values.iter_mut().zip(window.iter()) {
    *v *= w;
  }
}

/// A flat power spectral density for white noise of strength `sigma`
/// (in pixel units at `bit_depth`), matching the unitary block transform.
pub fn flat_noise_psd(
  sigma: f64, bit_depth: usize, block_size: usize,
) -> Vec<f64> {
  let normalized = sigma / ((1usize << bit_depth) - 1) as f64;
  vec![normalized * normalized; block_size * block_size]
}

struct PlaneKernel {
  finder: FlatBlockFinder,
  transform: BlockTransform,
  window: Vec<f64>,
}

impl PlaneKernel {
  fn new(
    block_size: usize, bit_depth: usize,
  ) -> Result<Self, DenoiseError> {
    let transform = BlockTransform::new(block_size)
      .ok_or(DenoiseError::UnsupportedBlockSize(block_size))?;
    Ok(Self {
      finder: FlatBlockFinder::new(block_size, bit_depth),
      transform,
      window: half_cos_window(block_size),
    })
  }
}

/// Wiener-denoises up to three planes into `denoised`, which must mirror
/// the geometry of `data`. `noise_psd` carries one PSD per plane, sized for
/// that plane's (possibly chroma-decimated) block.
pub fn wiener_denoise<T: Pixel>(
  data: &[Plane<T>], denoised: &mut [Plane<T>], noise_psd: &[&[f64]],
  block_size: usize, bit_depth: usize,
) -> Result<(), DenoiseError> {
  assert!(!data.is_empty() && data.len() <= 3);
  assert_eq!(data.len(), denoised.len());
  assert_eq!(data.len(), noise_psd.len());

  let chroma_sub = if data.len() > 1 {
    if data[1].cfg.xdec != data[1].cfg.ydec {
      return Err(DenoiseError::UnsupportedSubsampling);
    }
    data[1].cfg.xdec
  } else {
    0
  };

  let mut full = PlaneKernel::new(block_size, bit_depth)?;
  let mut chroma = if chroma_sub != 0 {
    Some(PlaneKernel::new(block_size >> chroma_sub, bit_depth)?)
  } else {
    None
  };

  let w = data[0].cfg.width;
  let h = data[0].cfg.height;
  let num_blocks_w = (w + block_size - 1) / block_size;
  let num_blocks_h = (h + block_size - 1) / block_size;
  let normalization = ((1usize << bit_depth) - 1) as f32;

  for (c, (plane, out)) in data.iter().zip(denoised.iter_mut()).enumerate() {
    let kernel = if c > 0 && chroma_sub != 0 {
      chroma.as_mut().unwrap()
    } else {
      &mut full
    };
    let bs = kernel.finder.block_size();
    debug!(
      "denoising plane {}: {}x{}, block size {}",
      c, plane.cfg.width, plane.cfg.height, bs
    );
    let result_stride = (num_blocks_w + 2) * bs;
    let result_height = (num_blocks_h + 2) * bs;
    let mut result = vec![0f32; result_stride * result_height];
    let mut plane_fit = vec![0.0; bs * bs];
    let mut block = vec![0.0; bs * bs];

    // Half-overlapped tiling: four offset phases per plane, with one extra
    // ring of border-replicated blocks so every pixel gets full coverage.
    for phase_y in 0..2 {
      let offs_y = phase_y * (bs / 2);
      for phase_x in 0..2 {
        let offs_x = phase_x * (bs / 2);
        for by in -1..num_blocks_h as isize {
          for bx in -1..num_blocks_w as isize {
            kernel.finder.extract_block(
              plane,
              bx * bs as isize + offs_x as isize,
              by * bs as isize + offs_y as isize,
              &mut plane_fit,
              &mut block,
            );
            pointwise_multiply(&kernel.window, &mut block);
            kernel.transform.forward(&block);
            kernel.transform.filter(noise_psd[c]);
            kernel.transform.inverse(&mut block);

            // Re-window the filtered residual; the background plane gets
            // the window twice so the overlap-add sums to unity.
            pointwise_multiply(&kernel.window, &mut block);
            pointwise_multiply(&kernel.window, &mut plane_fit);
            pointwise_multiply(&kernel.window, &mut plane_fit);

            for y in 0..bs {
              let y_result =
                (y as isize + (by + 1) * bs as isize) as usize + offs_y;
              for x in 0..bs {
                let x_result =
                  (x as isize + (bx + 1) * bs as isize) as usize + offs_x;
                result[y_result * result_stride + x_result] +=
                  (block[y * bs + x] + plane_fit[y * bs + x]) as f32;
              }
            }
          }
        }
      }
    }

    dither_and_quantize(&mut result, result_stride, bs, out, normalization);
  }
  Ok(())
}

/// Quantizes the floating overlap-add canvas back to pixels with
/// Floyd-Steinberg error diffusion.
fn dither_and_quantize<T: Pixel>(
  result: &mut [f32], result_stride: usize, block_size: usize,
  out: &mut Plane<T>, normalization: f32,
) {
  let w = out.cfg.width;
  let h = out.cfg.height;
  for (y, row) in
    out.mut_slice(Default::default()).rows_iter_mut().enumerate().take(h)
  {
    for x in 0..w {
      let result_idx = (y + block_size) * result_stride + x + block_size;
      let quantized =
        (result[result_idx] * normalization + 0.5).clamp(0.0, normalization);
      let new_val = quantized as u16;
      let err = -(f32::from(new_val) / normalization - result[result_idx]);
      row[x] = T::cast_from(new_val);
      if x + 1 < w {
        result[result_idx + 1] += err * 7.0 / 16.0;
      }
      if y + 1 < h {
        if x > 0 {
          result[result_idx + result_stride - 1] += err * 3.0 / 16.0;
        }
        result[result_idx + result_stride] += err * 5.0 / 16.0;
        if x + 1 < w {
          result[result_idx + result_stride + 1] += err * 1.0 / 16.0;
        }
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use rand::SeedableRng;
  use rand_chacha::ChaChaRng;
  use rand_distr::{Distribution, Normal};

  fn noisy_plane(w: usize, h: usize, sigma: f64, seed: u64) -> Plane<u8> {
    let mut rng = ChaChaRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    let mut plane = Plane::new(w, h, 0, 0, 0, 0);
    for row in plane.mut_slice(Default::default()).rows_iter_mut() {
      for px in row.iter_mut().take(w) {
        *px = (128.0 + normal.sample(&mut rng)).round().clamp(0.0, 255.0)
          as u8;
      }
    }
    plane
  }

  fn mse_from_constant(plane: &Plane<u8>, value: f64) -> f64 {
    let w = plane.cfg.width;
    let mut sum = 0.0;
    let mut n = 0usize;
    for row in plane.rows_iter() {
      for &px in row.iter().take(w) {
        let d = f64::from(px) - value;
        sum += d * d;
        n += 1;
      }
    }
    sum / n as f64
  }

  #[test]
  fn reduces_white_noise() {
    let sigma = 6.0;
    let data = noisy_plane(64, 64, sigma, 9);
    let mut denoised = vec![Plane::new(64, 64, 0, 0, 0, 0)];
    let psd = flat_noise_psd(sigma, 8, 32);
    wiener_denoise(
      std::slice::from_ref(&data),
      &mut denoised,
      &[&psd],
      32,
      8,
    )
    .unwrap();

    let before = mse_from_constant(&data, 128.0);
    let after = mse_from_constant(&denoised[0], 128.0);
    assert!(
      after < before * 0.5,
      "denoising did not reduce noise: {} -> {}",
      before,
      after
    );
  }

  #[test]
  fn rejects_anisotropic_subsampling() {
    let y = noisy_plane(64, 64, 2.0, 10);
    let mut u: Plane<u8> = Plane::new(32, 64, 1, 0, 0, 0);
    let w = u.cfg.width;
    for row in u.mut_slice(Default::default()).rows_iter_mut() {
      row[..w].iter_mut().for_each(|px| *px = 128);
    }
    let v = u.clone();
    let mut out = vec![y.clone(), u.clone(), v.clone()];
    let psd_y = flat_noise_psd(2.0, 8, 32);
    let psd_c = flat_noise_psd(2.0, 8, 16);
    let err = wiener_denoise(
      &[y, u, v],
      &mut out,
      &[&psd_y, &psd_c, &psd_c],
      32,
      8,
    )
    .unwrap_err();
    assert_eq!(err, DenoiseError::UnsupportedSubsampling);
  }

  #[test]
  fn rejects_non_power_of_two_blocks() {
    let data = noisy_plane(60, 60, 2.0, 11);
    let mut out = vec![Plane::new(60, 60, 0, 0, 0, 0)];
    let psd = flat_noise_psd(2.0, 8, 24);
    let err =
      wiener_denoise(std::slice::from_ref(&data), &mut out, &[&psd], 24, 8)
        .unwrap_err();
    assert_eq!(err, DenoiseError::UnsupportedBlockSize(24));
  }
}
