// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Detection of texturally flat blocks.
//!
//! Noise statistics are only trustworthy where the underlying image is
//! nearly constant, so the noise model samples residuals exclusively from
//! blocks this finder marks as flat. The features (gradient covariance
//! eigenvalues plus detrended variance) follow the noise-correlation
//! measurement of Kokaram, Kelly, Denman and Crawford (ICIP 2012).

use crate::math::{multiply_mat, EquationSystem};

use itertools::Itertools;
use log::debug;
use rayon::prelude::*;
use v_frame::pixel::{CastFromPrimitive, Pixel};
use v_frame::plane::Plane;

/// Degree of the fitted background: a plane `{y, x, 1}`.
const LOW_POLY_NUM_PARAMS: usize = 3;

/// Finds image blocks with little enough structure that their residual is
/// dominated by sensor or film noise.
///
/// The basis matrix for the background plane fit and its pseudo-inverse are
/// precomputed once per block size and shared, read-only, across every
/// block of every frame.
pub struct FlatBlockFinder {
  /// `block_size^2 x 3` polynomial basis over normalized coordinates.
  a: Vec<f64>,
  /// 3x3 inverse of `A^T A`.
  at_a_inv: [f64; LOW_POLY_NUM_PARAMS * LOW_POLY_NUM_PARAMS],
  block_size: usize,
  normalization: f64,
}

/// Mask value for blocks passing the hard flatness thresholds.
pub const FLAT_BLOCK_STRONG: u8 = 255;
/// Mask bit for blocks promoted by the top-decile score union.
pub const FLAT_BLOCK_SCORED: u8 = 1;

impl FlatBlockFinder {
  pub fn new(block_size: usize, bit_depth: usize) -> Self {
    assert!(block_size > 1);
    let n = block_size * block_size;
    let mut a = vec![0.0; n * LOW_POLY_NUM_PARAMS];
    let mut eqns = EquationSystem::new(LOW_POLY_NUM_PARAMS);

    let half = block_size as f64 / 2.0;
    for y in 0..block_size {
      let yd = (y as f64 - half) / half;
      for x in 0..block_size {
        let xd = (x as f64 - half) / half;
        let coords = [yd, xd, 1.0];
        let row = y * block_size + x;
        a[LOW_POLY_NUM_PARAMS * row] = yd;
        a[LOW_POLY_NUM_PARAMS * row + 1] = xd;
        a[LOW_POLY_NUM_PARAMS * row + 2] = 1.0;
        for i in 0..LOW_POLY_NUM_PARAMS {
          for j in 0..LOW_POLY_NUM_PARAMS {
            eqns.a[LOW_POLY_NUM_PARAMS * i + j] += coords[i] * coords[j];
          }
        }
      }
    }

    // Invert A^T A by solving against each standard basis vector.
    let mut at_a_inv = [0.0; LOW_POLY_NUM_PARAMS * LOW_POLY_NUM_PARAMS];
    for i in 0..LOW_POLY_NUM_PARAMS {
      eqns.b.iter_mut().for_each(|v| *v = 0.0);
      eqns.b[i] = 1.0;
      let solved = eqns.solve();
      debug_assert!(solved, "plane-fit normal matrix must be invertible");
      for j in 0..LOW_POLY_NUM_PARAMS {
        at_a_inv[j * LOW_POLY_NUM_PARAMS + i] = eqns.solution()[j];
      }
    }

    Self {
      a,
      at_a_inv,
      block_size,
      normalization: ((1usize << bit_depth) - 1) as f64,
    }
  }

  pub const fn block_size(&self) -> usize {
    self.block_size
  }

  /// Reads one block (border-replicated at the frame edges, normalized to
  /// `[0, 1]`), fits the background plane, and returns the fit in
  /// `plane_fit` with the residual left in `block`.
  pub fn extract_block<T: Pixel>(
    &self, data: &Plane<T>, offs_x: isize, offs_y: isize,
    plane_fit: &mut [f64], block: &mut [f64],
  ) {
    let bs = self.block_size;
    let n = bs * bs;
    assert!(plane_fit.len() >= n && block.len() >= n);
    let w = data.cfg.width;
    let h = data.cfg.height;

    for yi in 0..bs {
      let y = (offs_y + yi as isize).clamp(0, h as isize - 1) as usize;
      for xi in 0..bs {
        let x = (offs_x + xi as isize).clamp(0, w as isize - 1) as usize;
        block[yi * bs + xi] =
          f64::from(u32::cast_from(data.p(x, y))) / self.normalization;
      }
    }

    let mut at_b = [0.0; LOW_POLY_NUM_PARAMS];
    let mut plane_coords = [0.0; LOW_POLY_NUM_PARAMS];
    multiply_mat(block, &self.a, &mut at_b, 1, n, LOW_POLY_NUM_PARAMS);
    multiply_mat(
      &self.at_a_inv,
      &at_b,
      &mut plane_coords,
      LOW_POLY_NUM_PARAMS,
      LOW_POLY_NUM_PARAMS,
      1,
    );
    multiply_mat(&self.a, &plane_coords, plane_fit, n, LOW_POLY_NUM_PARAMS, 1);

    for (b, p) in block.iter_mut().zip(plane_fit.iter()) {
      *b -= p;
    }
  }

  /// Classifies every block of `data`, returning the flat-block mask (one
  /// byte per block, raster order) and the number of flat blocks.
  ///
  /// The mask is the union of the hard-thresholded blocks and the top
  /// tenth percentile of a logistic flatness score, so even busy frames
  /// yield some samples.
  pub fn run<T: Pixel>(&self, data: &Plane<T>) -> (Vec<u8>, usize) {
    let bs = self.block_size;
    let num_blocks_w = (data.cfg.width + bs - 1) / bs;
    let num_blocks_h = (data.cfg.height + bs - 1) / bs;
    let num_blocks = num_blocks_w * num_blocks_h;

    let results: Vec<(bool, f32)> = (0..num_blocks)
      .into_par_iter()
      .map(|bi| {
        let bx = bi % num_blocks_w;
        let by = bi / num_blocks_w;
        self.score_block(data, (bx * bs) as isize, (by * bs) as isize)
      })
      .collect();

    let mut flat_blocks = vec![0u8; num_blocks];
    let mut num_flat = 0;
    for (mask, &(is_flat, _)) in flat_blocks.iter_mut().zip(&results) {
      if is_flat {
        *mask = FLAT_BLOCK_STRONG;
        num_flat += 1;
      }
    }

    let score_threshold = results
      .iter()
      .map(|&(_, score)| score)
      .sorted_by(|a, b| a.partial_cmp(b).unwrap())
      .nth(num_blocks * 90 / 100)
      .unwrap();
    for (mask, &(_, score)) in flat_blocks.iter_mut().zip(&results) {
      if score >= score_threshold {
        if *mask == 0 {
          num_flat += 1;
        }
        *mask |= FLAT_BLOCK_SCORED;
      }
    }

    debug!("flat block finder: {}/{} blocks flat", num_flat, num_blocks);
    (flat_blocks, num_flat)
  }

  fn score_block<T: Pixel>(
    &self, data: &Plane<T>, offs_x: isize, offs_y: isize,
  ) -> (bool, f32) {
    // Thresholds are lenient so that extreme grain still models correctly.
    const TRACE_THRESHOLD: f64 = 0.15 / (32.0 * 32.0);
    const RATIO_THRESHOLD: f64 = 1.25;
    const NORM_THRESHOLD: f64 = 0.08 / (32.0 * 32.0);
    // Logistic weights over {var, ratio, trace, norm, 1}; variance is by far
    // the most discriminative feature.
    const SCORE_WEIGHTS: [f64; 5] = [-6682.0, -0.2056, 13087.0, -12434.0, 2.5694];

    let bs = self.block_size;
    let n = bs * bs;
    let var_threshold = 0.005 / n as f64;
    let mut plane_fit = vec![0.0; n];
    let mut block = vec![0.0; n];
    self.extract_block(data, offs_x, offs_y, &mut plane_fit, &mut block);

    let mut gxx = 0.0;
    let mut gxy = 0.0;
    let mut gyy = 0.0;
    let mut mean = 0.0;
    let mut var = 0.0;
    for yi in 1..bs - 1 {
      for xi in 1..bs - 1 {
        let gx = (block[yi * bs + xi + 1] - block[yi * bs + xi - 1]) / 2.0;
        let gy = (block[(yi + 1) * bs + xi] - block[(yi - 1) * bs + xi]) / 2.0;
        gxx += gx * gx;
        gxy += gx * gy;
        gyy += gy * gy;
        mean += block[yi * bs + xi];
        var += block[yi * bs + xi] * block[yi * bs + xi];
      }
    }
    let interior = ((bs - 2) * (bs - 2)) as f64;
    mean /= interior;
    gxx /= interior;
    gxy /= interior;
    gyy /= interior;
    var = var / interior - mean * mean;

    let trace = gxx + gyy;
    let det = gxx * gyy - gxy * gxy;
    let e1 = (trace + (trace * trace - 4.0 * det).sqrt()) / 2.0;
    let e2 = (trace - (trace * trace - 4.0 * det).sqrt()) / 2.0;
    let norm = e1; // spectral norm
    let ratio = e1 / e2.max(1e-6);

    let is_flat = trace < TRACE_THRESHOLD
      && ratio < RATIO_THRESHOLD
      && norm < NORM_THRESHOLD
      && var > var_threshold;
    let score = 1.0
      / (1.0
        + (-(SCORE_WEIGHTS[0] * var
          + SCORE_WEIGHTS[1] * ratio
          + SCORE_WEIGHTS[2] * trace
          + SCORE_WEIGHTS[3] * norm
          + SCORE_WEIGHTS[4]))
          .exp());
    (is_flat, if var > var_threshold { score as f32 } else { 0.0 })
  }
}
