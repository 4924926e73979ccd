// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Block motion search for temporal filtering.
//!
//! Full-pixel search by SAD around inherited predictors, then 1/8-pel
//! refinement against an interpolated predictor. Besides the whole block,
//! each quarter sub-block is searched independently so the filter can split
//! its weighting when the block straddles differently moving content.

use crate::mc::{put_8tap, MotionVector};

use v_frame::pixel::{CastFromPrimitive, Pixel};
use v_frame::plane::{Plane, PlaneOffset, PlaneSlice};

/// Allowed motion range for one block, in full-pel units.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MvLimits {
  pub col_min: isize,
  pub col_max: isize,
  pub row_min: isize,
  pub row_max: isize,
}

impl MvLimits {
  fn clamp(&self, mv_col: isize, mv_row: isize) -> (isize, isize) {
    (
      mv_col.clamp(self.col_min, self.col_max),
      mv_row.clamp(self.row_min, self.row_max),
    )
  }
}

/// Search result for one block against one reference frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MotionSearchResult {
  pub mv: MotionVector,
  /// SSE of the motion-compensated predictor over the whole block.
  pub error: u64,
  /// Row-major quarter sub-block motion vectors.
  pub subblock_mvs: [MotionVector; 4],
  pub subblock_errors: [u64; 4],
}

pub(crate) fn get_sad<T: Pixel>(
  plane_org: &PlaneSlice<'_, T>, plane_ref: &PlaneSlice<'_, T>,
  blk_w: usize, blk_h: usize,
) -> u32 {
  let org_iter = plane_org.rows_iter().take(blk_h);
  let ref_iter = plane_ref.rows_iter();
  org_iter
    .zip(ref_iter)
    .map(|(org_row, ref_row)| {
      org_row[..blk_w]
        .iter()
        .zip(&ref_row[..blk_w])
        .map(|(&a, &b)| (i32::cast_from(a) - i32::cast_from(b)).unsigned_abs())
        .sum::<u32>()
    })
    .sum()
}

fn get_sse<T: Pixel>(
  plane_org: &PlaneSlice<'_, T>, rows: &[T], row_stride: usize, blk_w: usize,
  blk_h: usize,
) -> u64 {
  plane_org
    .rows_iter()
    .take(blk_h)
    .zip(rows.chunks(row_stride))
    .map(|(org_row, ref_row)| {
      org_row[..blk_w]
        .iter()
        .zip(&ref_row[..blk_w])
        .map(|(&a, &b)| {
          let d = i64::from(i32::cast_from(a) - i32::cast_from(b));
          (d * d) as u64
        })
        .sum::<u64>()
    })
    .sum()
}

/// Full-pixel SAD search: seeded candidates, a coarse sweep, then a 3x3
/// refinement. Returns the best motion vector in 1/8-pel units.
fn full_pixel_search<T: Pixel>(
  src: &Plane<T>, reference: &Plane<T>, po: PlaneOffset, blk_w: usize,
  blk_h: usize, start_mv: MotionVector, limits: &MvLimits,
) -> MotionVector {
  let src_slice = src.slice(po);
  let mut best_cost = u32::MAX;
  let mut best = (0isize, 0isize);

  let consider = |mv_col: isize, mv_row: isize, best: &mut (isize, isize),
                  best_cost: &mut u32| {
    let (mv_col, mv_row) = limits.clamp(mv_col, mv_row);
    let ref_slice =
      reference.slice(PlaneOffset { x: po.x + mv_col, y: po.y + mv_row });
    let cost = get_sad(&src_slice, &ref_slice, blk_w, blk_h);
    if cost < *best_cost {
      *best_cost = cost;
      *best = (mv_col, mv_row);
    }
  };

  for &(c, r) in &[
    (start_mv.col as isize / 8, start_mv.row as isize / 8),
    (0, 0),
  ] {
    consider(c, r, &mut best, &mut best_cost);
  }

  const RANGE: isize = 16;
  let center = best;
  for r in (-RANGE..=RANGE).step_by(2) {
    for c in (-RANGE..=RANGE).step_by(2) {
      consider(center.0 + c, center.1 + r, &mut best, &mut best_cost);
    }
  }
  let center = best;
  for r in -1..=1isize {
    for c in -1..=1isize {
      consider(center.0 + c, center.1 + r, &mut best, &mut best_cost);
    }
  }

  MotionVector { row: (best.1 * 8) as i16, col: (best.0 * 8) as i16 }
}

/// Evaluates the interpolated predictor at `cand_mv` and returns its SSE.
fn predictor_sse<T: Pixel>(
  src: &Plane<T>, reference: &Plane<T>, po: PlaneOffset, blk_w: usize,
  blk_h: usize, cand_mv: MotionVector, bit_depth: usize, scratch: &mut [T],
) -> u64 {
  let ref_slice = reference.slice(PlaneOffset {
    x: po.x + (cand_mv.col >> 3) as isize,
    y: po.y + (cand_mv.row >> 3) as isize,
  });
  put_8tap(
    scratch,
    blk_w,
    ref_slice,
    blk_w,
    blk_h,
    i32::from((cand_mv.col & 7) << 1),
    i32::from((cand_mv.row & 7) << 1),
    bit_depth,
  );
  get_sse(&src.slice(po), scratch, blk_w, blk_w, blk_h)
}

/// 1/8-pel refinement by shrinking 3x3 neighborhoods around the best
/// candidate so far.
fn subpel_refine<T: Pixel>(
  src: &Plane<T>, reference: &Plane<T>, po: PlaneOffset, blk_w: usize,
  blk_h: usize, fullpel_mv: MotionVector, limits: &MvLimits,
  bit_depth: usize,
) -> (MotionVector, u64) {
  let mut scratch = vec![T::cast_from(0u8); blk_w * blk_h];
  let mut best_mv = fullpel_mv;
  let mut best_err = predictor_sse(
    src, reference, po, blk_w, blk_h, fullpel_mv, bit_depth, &mut scratch,
  );

  for step in [4i16, 2, 1] {
    let center = best_mv;
    for i in 0..3 {
      for j in 0..3 {
        if i == 1 && j == 1 {
          continue;
        }
        let cand_mv = MotionVector {
          row: center.row + step * (i - 1),
          col: center.col + step * (j - 1),
        };
        if (cand_mv.col as isize) < limits.col_min * 8
          || (cand_mv.col as isize) > limits.col_max * 8
          || (cand_mv.row as isize) < limits.row_min * 8
          || (cand_mv.row as isize) > limits.row_max * 8
        {
          continue;
        }
        let err = predictor_sse(
          src, reference, po, blk_w, blk_h, cand_mv, bit_depth, &mut scratch,
        );
        if err < best_err {
          best_err = err;
          best_mv = cand_mv;
        }
      }
    }
  }
  (best_mv, best_err)
}

/// Searches one block of `reference` against `src`, seeded from `ref_mv`.
///
/// With `force_integer_mv` only the whole-block full-pixel result is
/// produced and the sub-block entries are left at the error sentinel.
#[allow(clippy::too_many_arguments)]
pub(crate) fn motion_search<T: Pixel>(
  src: &Plane<T>, reference: &Plane<T>, block_size: usize, mb_row: usize,
  mb_col: usize, ref_mv: MotionVector, limits: &MvLimits,
  force_integer_mv: bool, bit_depth: usize,
) -> MotionSearchResult {
  let po = PlaneOffset {
    x: (mb_col * block_size) as isize,
    y: (mb_row * block_size) as isize,
  };
  let fullpel_mv = full_pixel_search(
    src, reference, po, block_size, block_size, ref_mv, limits,
  );

  if force_integer_mv {
    let mut scratch = vec![T::cast_from(0u8); block_size * block_size];
    let error = predictor_sse(
      src,
      reference,
      po,
      block_size,
      block_size,
      fullpel_mv,
      bit_depth,
      &mut scratch,
    );
    return MotionSearchResult {
      mv: fullpel_mv,
      error,
      subblock_mvs: [fullpel_mv; 4],
      subblock_errors: [u64::MAX; 4],
    };
  }

  let (mv, error) = subpel_refine(
    src, reference, po, block_size, block_size, fullpel_mv, limits, bit_depth,
  );

  // Quarter sub-blocks, each seeded from the refined whole-block vector.
  let half = block_size / 2;
  let mut subblock_mvs = [MotionVector::default(); 4];
  let mut subblock_errors = [0u64; 4];
  for (idx, (dy, dx)) in
    [(0, 0), (0, half), (half, 0), (half, half)].iter().enumerate()
  {
    let sub_po = PlaneOffset { x: po.x + *dx as isize, y: po.y + *dy as isize };
    let sub_fullpel =
      full_pixel_search(src, reference, sub_po, half, half, mv, limits);
    let (sub_mv, sub_err) = subpel_refine(
      src, reference, sub_po, half, half, sub_fullpel, limits, bit_depth,
    );
    subblock_mvs[idx] = sub_mv;
    subblock_errors[idx] = sub_err;
  }

  MotionSearchResult { mv, error, subblock_mvs, subblock_errors }
}

#[cfg(test)]
mod test {
  use super::*;

  fn textured_plane(w: usize, h: usize, pad: usize, shift: usize) -> Plane<u8> {
    let mut plane = Plane::new(w, h, 0, 0, pad, pad);
    for (y, row) in
      plane.mut_slice(PlaneOffset::default()).rows_iter_mut().enumerate()
    {
      for (x, px) in row.iter_mut().enumerate().take(w) {
        let sx = x + shift;
        *px = ((sx * sx + 3 * y * sx + y * y) % 251) as u8;
      }
    }
    plane.pad(w, h);
    plane
  }

  #[test]
  fn finds_pure_translation() {
    let src = textured_plane(96, 96, 48, 4);
    let reference = textured_plane(96, 96, 48, 0);
    let limits =
      MvLimits { col_min: -24, col_max: 24, row_min: -24, row_max: 24 };
    let result = motion_search(
      &src,
      &reference,
      32,
      1,
      1,
      MotionVector::default(),
      &limits,
      false,
      8,
    );
    // The reference is the source shifted left by 4: the best match sits 4
    // pixels to the right.
    assert_eq!(result.mv, MotionVector { row: 0, col: 32 });
    assert_eq!(result.error, 0);
    for (mv, err) in result.subblock_mvs.iter().zip(&result.subblock_errors) {
      assert_eq!(*mv, MotionVector { row: 0, col: 32 });
      assert_eq!(*err, 0);
    }
  }

  #[test]
  fn identical_frames_give_zero_mv() {
    let src = textured_plane(64, 64, 48, 0);
    let limits =
      MvLimits { col_min: -24, col_max: 24, row_min: -24, row_max: 24 };
    let result = motion_search(
      &src,
      &src,
      32,
      0,
      0,
      MotionVector::default(),
      &limits,
      false,
      8,
    );
    assert!(result.mv.is_zero());
    assert_eq!(result.error, 0);
  }
}
