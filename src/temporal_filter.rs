// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Multi-frame temporal filtering.
//!
//! Builds a denoised "alt-ref" style frame by motion-compensating a set of
//! candidate frames onto the frame to be filtered and blending them with
//! non-local-mean weights: each pixel's contribution is discounted by the
//! squared prediction error in a small window around it. Three weighting
//! strategies are used depending on resolution and plane count.

use crate::mc::{put_8tap, MotionVector};
use crate::me::{motion_search, MotionSearchResult, MvLimits};

use log::debug;
use thiserror::Error;
use v_frame::pixel::{CastFromPrimitive, Pixel};
use v_frame::plane::{Plane, PlaneOffset};

/// How far outside the frame a motion vector may point, in full pels.
/// Derived from the interpolation filter reach against the padded border.
const MV_BORDER: isize = 9;
/// Padding applied to working copies of the candidate frames.
const FRAME_PAD: usize = 16;

const WINDOW_LENGTH: usize = 3;
const HALF_WINDOW: isize = (WINDOW_LENGTH / 2) as isize;

/// Weight scale used by the plane-wise (high resolution) strategy.
const PLANEWISE_WEIGHT_SCALE: f64 = 32.0;
/// Resolution bound separating the windowed YUV strategy from plane-wise.
const PLANEWISE_MIN_DIMENSION: usize = 480;

/// Whole-block error thresholds get this extra headroom versus the
/// per-sub-block ones, biasing the decision toward unsplit weighting.
const THR_SHIFT: u32 = 2;
const SEARCH_ERROR_LOW: u64 = 10000;
const SEARCH_ERROR_HIGH: u64 = 20000;
/// Blocks matching worse than this stop seeding the next frame's search.
const MV_INHERIT_SSE_MAX: u64 = 3000;

const EDGE_THRESHOLD: i64 = 50;
const SQRT_PI_BY_2: f64 = 1.253_314_137_315_500_3;

/// Weight-adjustment multipliers keyed by the number of window samples that
/// actually contributed (image edges truncate the window).
const WEIGHT_MULTIPLIER_YUV: [u32; 14] = [
  0, 0, 0, 0, 49152, 39322, 32768, 28087, 24576, 21846, 19661, 17874, 0,
  15124,
];
const WEIGHT_MULTIPLIER_YUV_HBD: [u64; 14] = [
  0,
  0,
  0,
  0,
  3221225472,
  2576980378,
  2147483648,
  1840700270,
  1610612736,
  1431655766,
  1288490189,
  1171354718,
  0,
  991146300,
];

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TemporalFilterError {
  #[error("invalid filtering block size {0} (expected a power of two >= 16)")]
  InvalidBlockSize(usize),
  #[error("candidate slot {0} does not hold the frame to filter")]
  MissingTargetFrame(usize),
  #[error("candidate frames must carry 1 or 3 planes of matching geometry")]
  MismatchedFrames,
}

/// Temporal filter configuration. Frame-level inputs derived from rate
/// control (strength, second-pass flags) are plain values here.
#[derive(Clone, Copy, Debug)]
pub struct TemporalFilterConfig {
  pub block_size: usize,
  /// Base filter strength, typically from [`estimate_strength`].
  pub strength: i32,
  /// Second alt-ref pass: nearer references, tighter thresholds, heavier
  /// self weight.
  pub second_alt_ref: bool,
  pub force_integer_mv: bool,
  /// Screen content disables the plane-wise strategy at high resolution.
  pub allow_screen_content_tools: bool,
  pub bit_depth: usize,
}

impl Default for TemporalFilterConfig {
  fn default() -> Self {
    Self {
      block_size: 32,
      strength: 5,
      second_alt_ref: false,
      force_integer_mv: false,
      allow_screen_content_tools: false,
      bit_depth: 8,
    }
  }
}

/// Running sum and sum-of-squares of the per-block SSE between the source
/// and the filtered result, for the caller's show-filtered-or-original
/// decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameDiff {
  pub sum: u64,
  pub sse: u64,
}

#[derive(Debug)]
pub struct TemporalFilter {
  cfg: TemporalFilterConfig,
}

impl TemporalFilter {
  pub fn new(
    cfg: TemporalFilterConfig,
  ) -> Result<Self, TemporalFilterError> {
    if cfg.block_size < 16 || !cfg.block_size.is_power_of_two() {
      return Err(TemporalFilterError::InvalidBlockSize(cfg.block_size));
    }
    Ok(Self { cfg })
  }

  pub const fn config(&self) -> &TemporalFilterConfig {
    &self.cfg
  }

  /// Filters the frame at `filter_index` against every present candidate in
  /// `frames` (absent slots are skipped) and returns the filtered planes
  /// together with the source-vs-filtered difference statistic.
  pub fn filter_frame<T: Pixel>(
    &self, frames: &[Option<&[Plane<T>]>], filter_index: usize,
    noise_level: f64,
  ) -> Result<(Vec<Plane<T>>, FrameDiff), TemporalFilterError> {
    let bs = self.cfg.block_size;
    let target = frames
      .get(filter_index)
      .copied()
      .flatten()
      .ok_or(TemporalFilterError::MissingTargetFrame(filter_index))?;
    let num_planes = target.len();
    if num_planes != 1 && num_planes != 3 {
      return Err(TemporalFilterError::MismatchedFrames);
    }
    for frame in frames.iter().flatten() {
      if frame.len() != num_planes
        || frame.iter().zip(target.iter()).any(|(a, b)| {
          a.cfg.width != b.cfg.width || a.cfg.height != b.cfg.height
        })
      {
        return Err(TemporalFilterError::MismatchedFrames);
      }
    }

    let w = target[0].cfg.width;
    let h = target[0].cfg.height;
    let mb_cols = (w + bs - 1) / bs;
    let mb_rows = (h + bs - 1) / bs;
    let bd_shift = (self.cfg.bit_depth - 8) as u32;
    let noise_level = noise_level.max(0.0);

    // Working copies with replicated borders: motion vectors may point a
    // little outside the frame and the 8-tap filter needs support pixels.
    let pad = bs + FRAME_PAD;
    let padded: Vec<Option<Vec<Plane<T>>>> = frames
      .iter()
      .map(|f| f.map(|planes| planes.iter().map(|p| padded_copy(p, pad)).collect()))
      .collect();
    let padded_target = padded[filter_index].as_ref().unwrap();

    let use_planewise =
      !self.cfg.allow_screen_content_tools && w.min(h) >= PLANEWISE_MIN_DIMENSION;
    let strength = self.cfg.strength + 2 * bd_shift as i32;
    debug_assert!(strength >= 0);

    let mb_pels = bs * bs;
    let mut accum = vec![0u32; mb_pels * 3];
    let mut count = vec![0u16; mb_pels * 3];
    let mut pred = vec![T::cast_from(0u8); mb_pels * 3];
    let mut square_diff = vec![0u32; mb_pels * 3];

    let mut output: Vec<Plane<T>> = target.to_vec();
    let mut diff = FrameDiff::default();

    for mb_row in 0..mb_rows {
      for mb_col in 0..mb_cols {
        accum.iter_mut().for_each(|v| *v = 0);
        count.iter_mut().for_each(|v| *v = 0);
        let limits = MvLimits {
          row_min: -((mb_row * bs) as isize + MV_BORDER),
          row_max: ((mb_rows - 1 - mb_row) * bs) as isize + MV_BORDER,
          col_min: -((mb_col * bs) as isize + MV_BORDER),
          col_max: ((mb_cols - 1 - mb_col) * bs) as isize + MV_BORDER,
        };

        // Inherited across candidate frames for this block; sign-flipped at
        // the target since later frames sit on the opposite temporal side.
        let mut ref_mv = MotionVector::default();

        for (frame_idx, frame) in padded.iter().enumerate() {
          let Some(planes) = frame else { continue };
          let mut subblock_mvs = [MotionVector::default(); 4];
          let mut block_mv = MotionVector::default();
          let mut blk_fw = [0u32; 4];
          let mut use_whole_block = true;

          if frame_idx == filter_index {
            let weight = if self.cfg.second_alt_ref { 4 } else { 2 };
            blk_fw = [weight; 4];
            ref_mv = -ref_mv;
          } else {
            let result = motion_search(
              &padded_target[0],
              &planes[0],
              bs,
              mb_row,
              mb_col,
              ref_mv,
              &limits,
              self.cfg.force_integer_mv,
              self.cfg.bit_depth,
            );
            if !self.cfg.force_integer_mv {
              ref_mv = result.mv;
            }
            block_mv = result.mv;
            subblock_mvs = result.subblock_mvs;
            let decision = decide_block_weights(
              &result,
              self.cfg.second_alt_ref,
              self.cfg.force_integer_mv,
            );
            blk_fw = decision.0;
            use_whole_block = decision.1;
            if result.error > MV_INHERIT_SSE_MAX << bd_shift {
              ref_mv = MotionVector::default();
            }
          }

          if blk_fw.iter().all(|&fw| fw == 0) {
            continue;
          }
          build_predictor(
            planes,
            num_planes,
            bs,
            mb_row,
            mb_col,
            !use_whole_block,
            block_mv,
            &subblock_mvs,
            self.cfg.bit_depth,
            &mut pred,
          );
          if frame_idx == filter_index {
            let weight = if use_planewise {
              PLANEWISE_WEIGHT_SCALE as u32
            } else {
              blk_fw[0] * 16
            };
            apply_self_filter(
              target, num_planes, bs, weight, &pred, &mut accum, &mut count,
            );
          } else if use_planewise {
            apply_planewise_filter(
              padded_target,
              num_planes,
              bs,
              mb_row,
              mb_col,
              h,
              noise_level,
              &pred,
              &mut square_diff,
              &mut accum,
              &mut count,
            );
          } else {
            apply_windowed_filter(
              padded_target,
              num_planes,
              bs,
              mb_row,
              mb_col,
              strength as u32,
              !use_whole_block,
              &blk_fw,
              self.cfg.bit_depth,
              &pred,
              &mut square_diff,
              &mut accum,
              &mut count,
            );
          }
        }

        let block_sse = normalize_block(
          &mut output, target, num_planes, bs, mb_row, mb_col, &accum, &count,
        );
        diff.sum += block_sse;
        diff.sse += block_sse * block_sse;
      }
    }
    debug!(
      "temporal filter: {}x{} blocks, diff sum {} sse {}",
      mb_cols, mb_rows, diff.sum, diff.sse
    );
    Ok((output, diff))
  }
}

/// Per-block filter weights: either one weight for the whole block or four
/// independent sub-block weights when the sub-block searches disagree with
/// the whole-block result.
fn decide_block_weights(
  result: &MotionSearchResult, second_alt_ref: bool, force_integer_mv: bool,
) -> ([u32; 4], bool) {
  let thresh_low = SEARCH_ERROR_LOW >> u32::from(second_alt_ref);
  let thresh_high = SEARCH_ERROR_HIGH >> u32::from(second_alt_ref);
  let err = result.error;

  let weight_for = |error: u64, low: u64, high: u64| {
    if error < low {
      2
    } else if error < high {
      1
    } else {
      0
    }
  };

  let use_whole_block = if force_integer_mv {
    true
  } else {
    let err16: u64 = result.subblock_errors.iter().sum();
    let max_err = *result.subblock_errors.iter().max().unwrap();
    let min_err = *result.subblock_errors.iter().min().unwrap();
    (err * 15 < err16 << 4 && max_err - min_err < 12000)
      || (err * 14 < err16 << 4 && max_err - min_err < 6000)
  };

  if use_whole_block {
    let fw =
      weight_for(err, thresh_low << THR_SHIFT, thresh_high << THR_SHIFT);
    ([fw; 4], true)
  } else {
    let mut blk_fw = [0u32; 4];
    for (fw, &sub_err) in blk_fw.iter_mut().zip(&result.subblock_errors) {
      *fw = weight_for(sub_err, thresh_low, thresh_high);
    }
    (blk_fw, false)
  }
}

/// A copy of `src` with `pad` pixels of replicated border on every side.
fn padded_copy<T: Pixel>(src: &Plane<T>, pad: usize) -> Plane<T> {
  let w = src.cfg.width;
  let h = src.cfg.height;
  let mut dst =
    Plane::new(w, h, src.cfg.xdec, src.cfg.ydec, pad, pad);
  for (dst_row, src_row) in dst
    .mut_slice(PlaneOffset::default())
    .rows_iter_mut()
    .zip(src.rows_iter())
  {
    dst_row[..w].copy_from_slice(&src_row[..w]);
  }
  dst.pad(w << src.cfg.xdec, h << src.cfg.ydec);
  dst
}

/// Motion-compensates one block of every plane of `ref_planes` into `pred`
/// (plane-major, `block_size^2` samples reserved per plane).
#[allow(clippy::too_many_arguments)]
fn build_predictor<T: Pixel>(
  ref_planes: &[Plane<T>], num_planes: usize, block_size: usize,
  mb_row: usize, mb_col: usize, use_subblock: bool, mb_mv: MotionVector,
  subblock_mvs: &[MotionVector; 4], bit_depth: usize, pred: &mut [T],
) {
  let mb_pels = block_size * block_size;
  for (plane_idx, plane) in ref_planes.iter().take(num_planes).enumerate() {
    let xdec = plane.cfg.xdec;
    let ydec = plane.cfg.ydec;
    let plane_w = block_size >> xdec;
    let plane_h = block_size >> ydec;
    let plane_x = (mb_col * block_size) >> xdec;
    let plane_y = (mb_row * block_size) >> ydec;
    let sub_w = if use_subblock { plane_w / 2 } else { plane_w };
    let sub_h = if use_subblock { plane_h / 2 } else { plane_h };

    let mut subblock_idx = 0;
    for i in (0..plane_h).step_by(sub_h) {
      for j in (0..plane_w).step_by(sub_w) {
        let mv = if use_subblock { subblock_mvs[subblock_idx] } else { mb_mv }
          .for_plane(xdec, ydec);
        let slice = plane.slice(PlaneOffset {
          x: (plane_x + j) as isize + (mv.col >> 3) as isize,
          y: (plane_y + i) as isize + (mv.row >> 3) as isize,
        });
        put_8tap(
          &mut pred[plane_idx * mb_pels + i * plane_w + j..],
          plane_w,
          slice,
          sub_w,
          sub_h,
          i32::from((mv.col & 7) << 1),
          i32::from((mv.row & 7) << 1),
          bit_depth,
        );
        subblock_idx += 1;
      }
    }
  }
}

/// Flat-weight accumulation for the frame being filtered itself.
fn apply_self_filter<T: Pixel>(
  target: &[Plane<T>], num_planes: usize, block_size: usize,
  filter_weight: u32, pred: &[T], accum: &mut [u32], count: &mut [u16],
) {
  let mb_pels = block_size * block_size;
  for (plane_idx, plane) in target.iter().take(num_planes).enumerate() {
    let plane_w = block_size >> plane.cfg.xdec;
    let plane_h = block_size >> plane.cfg.ydec;
    for i in 0..plane_h {
      for j in 0..plane_w {
        let idx = plane_idx * mb_pels + i * plane_w + j;
        accum[idx] += filter_weight * u32::cast_from(pred[idx]);
        count[idx] += filter_weight as u16;
      }
    }
  }
}

/// Pixel-wise squared difference between the target block and a predictor.
fn compute_square_diff<T: Pixel>(
  target: &Plane<T>, x0: usize, y0: usize, pred: &[T], stride: usize,
  w: usize, h: usize, out: &mut [u32],
) {
  for i in 0..h {
    for j in 0..w {
      let ref_value = i32::cast_from(target.p(x0 + j, y0 + i));
      let pred_value = i32::cast_from(pred[i * stride + j]);
      let diff = (ref_value - pred_value).unsigned_abs();
      out[i * w + j] = diff * diff;
    }
  }
}

fn adjust_filter_weight_yuv(
  filter_weight: u32, sum_square_diff: u64, num_ref_pixels: usize,
  strength: u32, high_bitdepth: bool,
) -> u32 {
  let modifier = if high_bitdepth {
    let multiplier = WEIGHT_MULTIPLIER_YUV_HBD[num_ref_pixels];
    debug_assert!(multiplier != 0);
    ((sum_square_diff.min(u64::from(u32::MAX)) as u128 * multiplier as u128)
      >> 32) as u64
  } else {
    let multiplier = u64::from(WEIGHT_MULTIPLIER_YUV[num_ref_pixels]);
    debug_assert!(multiplier != 0);
    (sum_square_diff.min(u64::from(u16::MAX)) * multiplier) >> 16
  };
  let rounding = (1u64 << strength) >> 1;
  let modifier = (modifier + rounding) >> strength;
  if modifier >= 16 {
    0
  } else {
    (16 - modifier) as u32 * filter_weight
  }
}

fn adjust_filter_weight_y_only(
  filter_weight: u32, sum_square_diff: u64, num_ref_pixels: usize,
  strength: u32,
) -> u32 {
  let modifier =
    (sum_square_diff * 3).min(i32::MAX as u64) / num_ref_pixels as u64;
  let rounding = (1u64 << strength) >> 1;
  let modifier = (modifier + rounding) >> strength;
  if modifier >= 16 {
    0
  } else {
    (16 - modifier) as u32 * filter_weight
  }
}

/// Windowed weighting for low-resolution content: 3x3 same-plane windows
/// plus cross-plane coupling when chroma is present.
#[allow(clippy::too_many_arguments)]
fn apply_windowed_filter<T: Pixel>(
  target: &[Plane<T>], num_planes: usize, block_size: usize, mb_row: usize,
  mb_col: usize, strength: u32, use_subblock: bool, blk_fw: &[u32; 4],
  bit_depth: usize, pred: &[T], square_diff: &mut [u32],
  accum: &mut [u32], count: &mut [u16],
) {
  let mb_pels = block_size * block_size;
  let high_bitdepth = bit_depth > 8;
  square_diff.iter_mut().for_each(|v| *v = 0);
  for (plane_idx, plane) in target.iter().take(num_planes).enumerate() {
    let plane_w = block_size >> plane.cfg.xdec;
    let plane_h = block_size >> plane.cfg.ydec;
    compute_square_diff(
      plane,
      (mb_col * block_size) >> plane.cfg.xdec,
      (mb_row * block_size) >> plane.cfg.ydec,
      &pred[plane_idx * mb_pels..],
      plane_w,
      plane_w,
      plane_h,
      &mut square_diff[plane_idx * mb_pels..],
    );
  }

  for (plane_idx, plane) in target.iter().take(num_planes).enumerate() {
    let ss_x = plane.cfg.xdec;
    let ss_y = plane.cfg.ydec;
    let plane_w = block_size >> ss_x;
    let plane_h = block_size >> ss_y;
    for i in 0..plane_h {
      for j in 0..plane_w {
        let subblock_idx = if use_subblock {
          usize::from(i >= plane_h / 2) * 2 + usize::from(j >= plane_w / 2)
        } else {
          0
        };
        let filter_weight = blk_fw[subblock_idx];

        let mut sum_square_diff = 0u64;
        let mut num_ref_pixels = 0usize;
        for wi in -HALF_WINDOW..=HALF_WINDOW {
          for wj in -HALF_WINDOW..=HALF_WINDOW {
            let y = i as isize + wi;
            let x = j as isize + wj;
            if y >= 0 && y < plane_h as isize && x >= 0 && x < plane_w as isize
            {
              sum_square_diff += u64::from(
                square_diff
                  [plane_idx * mb_pels + y as usize * plane_w + x as usize],
              );
              num_ref_pixels += 1;
            }
          }
        }

        if num_planes > 1 {
          if plane_idx == 0 {
            // Couple luma to the co-located chroma samples.
            for (p, chroma) in
              target.iter().enumerate().take(num_planes).skip(1)
            {
              let ss_x_shift = chroma.cfg.xdec - ss_x;
              let ss_y_shift = chroma.cfg.ydec - ss_y;
              let xx = j >> ss_x_shift;
              let yy = i >> ss_y_shift;
              let ww = plane_w >> ss_x_shift;
              sum_square_diff +=
                u64::from(square_diff[p * mb_pels + yy * ww + xx]);
              num_ref_pixels += 1;
            }
          } else {
            // Couple chroma to the (upsampled) co-located luma samples.
            let ss_x_shift = ss_x - target[0].cfg.xdec;
            let ss_y_shift = ss_y - target[0].cfg.ydec;
            for ii in 0..1 << ss_y_shift {
              for jj in 0..1 << ss_x_shift {
                let yy = (i << ss_y_shift) + ii;
                let xx = (j << ss_x_shift) + jj;
                let ww = plane_w << ss_x_shift;
                sum_square_diff += u64::from(square_diff[yy * ww + xx]);
                num_ref_pixels += 1;
              }
            }
          }
        }

        let idx = plane_idx * mb_pels + i * plane_w + j;
        let adjusted_weight = if num_planes > 1 {
          adjust_filter_weight_yuv(
            filter_weight,
            sum_square_diff,
            num_ref_pixels,
            strength,
            high_bitdepth,
          )
        } else {
          adjust_filter_weight_y_only(
            filter_weight,
            sum_square_diff,
            num_ref_pixels,
            strength,
          )
        };
        accum[idx] += adjusted_weight * u32::cast_from(pred[idx]);
        count[idx] += adjusted_weight as u16;
      }
    }
  }
}

/// Plane-wise exponential weighting for high-resolution content: a pure
/// non-local-means weight per plane with no cross-plane coupling.
#[allow(clippy::too_many_arguments)]
fn apply_planewise_filter<T: Pixel>(
  target: &[Plane<T>], num_planes: usize, block_size: usize, mb_row: usize,
  mb_col: usize, frame_height: usize, noise_level: f64, pred: &[T],
  square_diff: &mut [u32], accum: &mut [u32], count: &mut [u16],
) {
  let decay_control = if frame_height >= PLANEWISE_MIN_DIMENSION { 4.0 } else { 3.0 };
  let r = decay_control * (0.7 + (noise_level + 0.5).ln());
  let mb_pels = block_size * block_size;

  square_diff.iter_mut().for_each(|v| *v = 0);
  for (plane_idx, plane) in target.iter().take(num_planes).enumerate() {
    let plane_w = block_size >> plane.cfg.xdec;
    let plane_h = block_size >> plane.cfg.ydec;
    compute_square_diff(
      plane,
      (mb_col * block_size) >> plane.cfg.xdec,
      (mb_row * block_size) >> plane.cfg.ydec,
      &pred[plane_idx * mb_pels..],
      plane_w,
      plane_w,
      plane_h,
      &mut square_diff[plane_idx * mb_pels..],
    );
  }

  for (plane_idx, plane) in target.iter().take(num_planes).enumerate() {
    let plane_w = block_size >> plane.cfg.xdec;
    let plane_h = block_size >> plane.cfg.ydec;
    for i in 0..plane_h {
      for j in 0..plane_w {
        let mut sum_square_diff = 0u64;
        let mut num_ref_pixels = 0usize;
        for wi in -HALF_WINDOW..=HALF_WINDOW {
          for wj in -HALF_WINDOW..=HALF_WINDOW {
            // The window is clamped at the edges rather than truncated.
            let y = (i as isize + wi).clamp(0, plane_h as isize - 1) as usize;
            let x = (j as isize + wj).clamp(0, plane_w as isize - 1) as usize;
            sum_square_diff +=
              u64::from(square_diff[plane_idx * mb_pels + y * plane_w + x]);
            num_ref_pixels += 1;
          }
        }
        let scaled_diff = (-((sum_square_diff / num_ref_pixels as u64) as f64)
          / (2.0 * r * r))
          .max(-15.0);
        let adjusted_weight =
          (scaled_diff.exp() * PLANEWISE_WEIGHT_SCALE) as u32;
        let idx = plane_idx * mb_pels + i * plane_w + j;
        accum[idx] += adjusted_weight * u32::cast_from(pred[idx]);
        count[idx] += adjusted_weight as u16;
      }
    }
  }
}

/// Writes one normalized block into `output`, rounding to nearest, and
/// returns the luma SSE between the filtered block and the source.
#[allow(clippy::too_many_arguments)]
fn normalize_block<T: Pixel>(
  output: &mut [Plane<T>], target: &[Plane<T>], num_planes: usize,
  block_size: usize, mb_row: usize, mb_col: usize, accum: &[u32],
  count: &[u16],
) -> u64 {
  let mb_pels = block_size * block_size;
  let mut luma_sse = 0u64;
  for plane_idx in 0..num_planes {
    let out_plane = &mut output[plane_idx];
    let xdec = out_plane.cfg.xdec;
    let ydec = out_plane.cfg.ydec;
    let plane_w = block_size >> xdec;
    let plane_h = block_size >> ydec;
    let x0 = (mb_col * block_size) >> xdec;
    let y0 = (mb_row * block_size) >> ydec;
    let max_w = out_plane.cfg.width.saturating_sub(x0).min(plane_w);
    let max_h = out_plane.cfg.height.saturating_sub(y0).min(plane_h);

    let mut out_slice =
      out_plane.mut_slice(PlaneOffset { x: x0 as isize, y: y0 as isize });
    let mut rows = out_slice.rows_iter_mut();
    for i in 0..max_h {
      let row = rows.next().unwrap();
      for (j, px) in row.iter_mut().enumerate().take(max_w) {
        let idx = plane_idx * mb_pels + i * plane_w + j;
        debug_assert!(count[idx] > 0);
        let filtered = (accum[idx] + u32::from(count[idx] >> 1))
          / u32::from(count[idx]);
        *px = T::cast_from(filtered);
        if plane_idx == 0 {
          let src = i32::cast_from(target[0].p(x0 + j, y0 + i));
          let d = i64::from(src - filtered as i32);
          luma_sse += (d * d) as u64;
        }
      }
    }
  }
  luma_sse
}

/// Robust frame noise estimation from the Laplacian over non-edge pixels
/// (Tai and Yang, "A fast method for image noise estimation using Laplacian
/// operator and adaptive edge detection", ISCCSP 2008).
///
/// Returns `None` when fewer than 16 smooth pixels qualify.
pub fn estimate_noise<T: Pixel>(
  plane: &Plane<T>, bit_depth: usize,
) -> Option<f64> {
  let w = plane.cfg.width;
  let h = plane.cfg.height;
  let shift = (bit_depth - 8) as u32;
  let round = |v: i64| (v + (1i64 << shift >> 1)) >> shift;
  let p = |x: usize, y: usize| i64::from(u32::cast_from(plane.p(x, y)));

  let mut sum = 0i64;
  let mut num = 0i64;
  for i in 1..h.saturating_sub(1) {
    for j in 1..w.saturating_sub(1) {
      let gx = (p(j - 1, i - 1) - p(j + 1, i - 1))
        + (p(j - 1, i + 1) - p(j + 1, i + 1))
        + 2 * (p(j - 1, i) - p(j + 1, i));
      let gy = (p(j - 1, i - 1) - p(j - 1, i + 1))
        + (p(j + 1, i - 1) - p(j + 1, i + 1))
        + 2 * (p(j, i - 1) - p(j, i + 1));
      let ga = round(gx.abs() + gy.abs());
      if ga < EDGE_THRESHOLD {
        let v = 4 * p(j, i)
          - 2 * (p(j - 1, i) + p(j + 1, i) + p(j, i - 1) + p(j, i + 1))
          + (p(j - 1, i - 1) + p(j + 1, i - 1) + p(j - 1, i + 1)
            + p(j + 1, i + 1));
        sum += round(v.abs());
        num += 1;
      }
    }
  }
  if num < 16 {
    return None;
  }
  Some(sum as f64 / (6.0 * num as f64) * SQRT_PI_BY_2)
}

/// Maps the estimated noise level and the frame's average quantizer to a
/// filter strength in `[0, group_boost / 300]`.
pub fn estimate_strength(
  base_strength: i32, noise_level: Option<f64>, avg_quantizer: f64,
  group_boost: i32,
) -> i32 {
  let mut adj_strength = base_strength;
  if let Some(noise) = noise_level {
    if noise > 0.0 {
      adj_strength += if noise < 0.75 {
        -2
      } else if noise < 1.75 {
        -1
      } else if noise < 4.0 {
        0
      } else {
        1
      };
    }
  }
  let q = avg_quantizer as i32;
  let strength =
    if q > 16 { adj_strength } else { adj_strength - (16 - q) / 2 };
  strength.clamp(0, group_boost / 300)
}

#[cfg(test)]
mod test {
  use super::*;
  use rand::SeedableRng;
  use rand_chacha::ChaChaRng;
  use rand_distr::{Distribution, Normal};

  fn textured_planes(
    w: usize, h: usize, chroma: bool, sigma: f64, seed: u64,
  ) -> Vec<Plane<u8>> {
    let mut rng = ChaChaRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma.max(1e-9)).unwrap();
    let mut fill = |plane: &mut Plane<u8>, scale: usize| {
      let w = plane.cfg.width;
      for (y, row) in
        plane.mut_slice(PlaneOffset::default()).rows_iter_mut().enumerate()
      {
        for (x, px) in row.iter_mut().enumerate().take(w) {
          let base = 64 + ((x * scale / 4 + y * scale / 8) % 128) as i32;
          let noise =
            if sigma > 0.0 { normal.sample(&mut rng) } else { 0.0 };
          *px = (base as f64 + noise).round().clamp(0.0, 255.0) as u8;
        }
      }
    };
    let mut planes = vec![Plane::new(w, h, 0, 0, 0, 0)];
    if chroma {
      planes.push(Plane::new(w / 2, h / 2, 1, 1, 0, 0));
      planes.push(Plane::new(w / 2, h / 2, 1, 1, 0, 0));
    }
    for (i, plane) in planes.iter_mut().enumerate() {
      fill(plane, 4 >> i.min(2));
    }
    planes
  }

  fn planes_equal(a: &[Plane<u8>], b: &[Plane<u8>]) -> bool {
    a.iter().zip(b.iter()).all(|(pa, pb)| {
      let w = pa.cfg.width;
      pa.rows_iter()
        .zip(pb.rows_iter())
        .all(|(ra, rb)| ra[..w] == rb[..w])
    })
  }

  #[test]
  fn self_only_is_identity() {
    let planes = textured_planes(64, 64, true, 0.0, 20);
    let refs: Vec<Option<&[Plane<u8>]>> = vec![Some(&planes)];
    let filter = TemporalFilter::new(TemporalFilterConfig::default()).unwrap();
    let (out, diff) = filter.filter_frame(&refs, 0, 0.0).unwrap();
    assert!(planes_equal(&out, &planes));
    assert_eq!(diff, FrameDiff::default());
  }

  #[test]
  fn identical_references_are_identity_y_only() {
    // Three bit-identical frames and strength 0: every squared difference
    // is zero, so no weight decays and the output reproduces the input.
    let planes = textured_planes(64, 64, false, 0.0, 21);
    let copy_a = planes.clone();
    let copy_b = planes.clone();
    let refs: Vec<Option<&[Plane<u8>]>> =
      vec![Some(&copy_a), Some(&planes), Some(&copy_b)];
    let cfg = TemporalFilterConfig { strength: 0, ..Default::default() };
    let filter = TemporalFilter::new(cfg).unwrap();
    let (out, diff) = filter.filter_frame(&refs, 1, 0.0).unwrap();
    assert!(planes_equal(&out, &planes));
    assert_eq!(diff, FrameDiff::default());
  }

  #[test]
  fn identical_references_are_identity_yuv() {
    let planes = textured_planes(64, 64, true, 0.0, 22);
    let copy = planes.clone();
    let refs: Vec<Option<&[Plane<u8>]>> = vec![Some(&copy), Some(&planes)];
    let cfg = TemporalFilterConfig { strength: 0, ..Default::default() };
    let filter = TemporalFilter::new(cfg).unwrap();
    let (out, _) = filter.filter_frame(&refs, 1, 0.0).unwrap();
    assert!(planes_equal(&out, &planes));
  }

  #[test]
  fn absent_slots_are_skipped() {
    let planes = textured_planes(64, 64, false, 0.0, 23);
    let refs: Vec<Option<&[Plane<u8>]>> =
      vec![None, Some(&planes), None];
    let filter = TemporalFilter::new(TemporalFilterConfig::default()).unwrap();
    let (out, _) = filter.filter_frame(&refs, 1, 0.0).unwrap();
    assert!(planes_equal(&out, &planes));
  }

  #[test]
  fn filtering_reduces_noise() {
    // Same scene with independent noise in each candidate: blending must
    // land closer to the clean signal than the noisy target was.
    let clean = textured_planes(64, 64, false, 0.0, 24);
    let noisy: Vec<Vec<Plane<u8>>> =
      (0..3).map(|i| textured_planes(64, 64, false, 3.0, 30 + i)).collect();
    let refs: Vec<Option<&[Plane<u8>]>> =
      noisy.iter().map(|f| Some(f.as_slice())).collect();
    let filter = TemporalFilter::new(TemporalFilterConfig::default()).unwrap();
    let (out, _) = filter.filter_frame(&refs, 1, 3.0).unwrap();

    let mse = |a: &Plane<u8>, b: &Plane<u8>| -> f64 {
      let w = a.cfg.width;
      let mut sum = 0.0;
      for (ra, rb) in a.rows_iter().zip(b.rows_iter()) {
        for (&pa, &pb) in ra[..w].iter().zip(&rb[..w]) {
          let d = f64::from(pa) - f64::from(pb);
          sum += d * d;
        }
      }
      sum / (w * a.cfg.height) as f64
    };
    let before = mse(&noisy[1][0], &clean[0]);
    let after = mse(&out[0], &clean[0]);
    assert!(
      after < before,
      "filtering did not denoise: {} -> {}",
      before,
      after
    );
  }

  #[test]
  fn missing_target_is_an_error() {
    let planes = textured_planes(64, 64, false, 0.0, 25);
    let refs: Vec<Option<&[Plane<u8>]>> = vec![Some(&planes), None];
    let filter = TemporalFilter::new(TemporalFilterConfig::default()).unwrap();
    assert_eq!(
      filter.filter_frame(&refs, 1, 0.0).unwrap_err(),
      TemporalFilterError::MissingTargetFrame(1)
    );
  }

  #[test]
  fn rejects_bad_block_size() {
    let cfg = TemporalFilterConfig { block_size: 24, ..Default::default() };
    assert_eq!(
      TemporalFilter::new(cfg).unwrap_err(),
      TemporalFilterError::InvalidBlockSize(24)
    );
  }

  #[test]
  fn noise_estimate_tracks_sigma() {
    let mut rng = ChaChaRng::seed_from_u64(26);
    let sigma: f64 = 4.0;
    let normal = Normal::new(0.0, sigma).unwrap();
    let mut plane: Plane<u8> = Plane::new(128, 128, 0, 0, 0, 0);
    let w = plane.cfg.width;
    for row in plane.mut_slice(PlaneOffset::default()).rows_iter_mut() {
      for px in row.iter_mut().take(w) {
        *px = (128.0 + normal.sample(&mut rng)).round().clamp(0.0, 255.0)
          as u8;
      }
    }
    let estimate = estimate_noise(&plane, 8).unwrap();
    assert!(
      (estimate - sigma).abs() < sigma * 0.25,
      "estimate {} too far from {}",
      estimate,
      sigma
    );
  }

  #[test]
  fn noise_estimate_needs_smooth_pixels() {
    // Fewer than 16 interior pixels can never qualify.
    let mut tiny: Plane<u8> = Plane::new(5, 5, 0, 0, 0, 0);
    let w = tiny.cfg.width;
    for row in tiny.mut_slice(PlaneOffset::default()).rows_iter_mut() {
      row[..w].iter_mut().for_each(|px| *px = 128);
    }
    assert_eq!(estimate_noise(&tiny, 8), None);

    // A frame that is all edges yields no qualifying pixels either.
    let mut edges: Plane<u8> = Plane::new(64, 64, 0, 0, 0, 0);
    let w = edges.cfg.width;
    for row in edges.mut_slice(PlaneOffset::default()).rows_iter_mut() {
      for (x, px) in row.iter_mut().enumerate().take(w) {
        *px = if (x % 4) < 2 { 0 } else { 255 };
      }
    }
    assert_eq!(estimate_noise(&edges, 8), None);
  }

  #[test]
  fn strength_estimation_bands() {
    assert_eq!(estimate_strength(5, Some(0.5), 40.0, 3000), 3);
    assert_eq!(estimate_strength(5, Some(1.0), 40.0, 3000), 4);
    assert_eq!(estimate_strength(5, Some(2.0), 40.0, 3000), 5);
    assert_eq!(estimate_strength(5, Some(8.0), 40.0, 3000), 6);
    // Low quantizers reduce the strength.
    assert_eq!(estimate_strength(5, Some(2.0), 10.0, 3000), 2);
    // Group boost caps it.
    assert_eq!(estimate_strength(5, Some(8.0), 40.0, 900), 3);
    // No estimate leaves the base strength untouched.
    assert_eq!(estimate_strength(5, None, 40.0, 3000), 5);
  }
}
