// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Autoregressive noise model estimation.
//!
//! Each update pairs a source frame with its denoised counterpart and, over
//! the flat blocks only, accumulates least-squares observations relating a
//! noise sample to its spatial neighborhood (Yule-Walker style) and per-block
//! noise strength to block intensity. Chroma channels carry one extra
//! coefficient for correlation with co-located luma noise. A "latest" state
//! is rebuilt from scratch every update while a "combined" state accumulates
//! across frames, unless the luma statistics diverge from history.

use crate::math::{normalized_cross_correlation, EquationSystem};
use crate::strength::NoiseStrengthSolver;

use arrayvec::ArrayVec;
use log::{debug, warn};
use thiserror::Error;
use v_frame::pixel::{CastFromPrimitive, Pixel};
use v_frame::plane::Plane;

/// Maximum supported AR lag.
pub const MAX_LAG: usize = 4;

/// Number of intensity bins used by the per-channel strength solvers.
const NUM_BINS: usize = 30;

/// Shape of the AR neighborhood around the predicted sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseShape {
  Diamond,
  Square,
}

/// Immutable noise model configuration.
#[derive(Clone, Copy, Debug)]
pub struct NoiseModelParams {
  pub shape: NoiseShape,
  /// AR neighborhood reach, `1..=4`.
  pub lag: usize,
  pub bit_depth: usize,
}

/// Errors surfaced by model construction and update.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NoiseModelError {
  #[error("invalid lag {lag} (expected >= 1, <= {MAX_LAG})")]
  InvalidLag { lag: usize },
  #[error("invalid block size {block_size} (expected > 1 and >= 2 * lag + 1)")]
  InvalidBlockSize { block_size: usize },
  #[error("not enough flat blocks to update the noise estimate ({found})")]
  InsufficientFlatBlocks { found: usize },
  #[error("solving the {0} system failed")]
  SolverFailure(&'static str),
}

/// Successful update outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseModelUpdate {
  /// The update was folded into the combined multi-frame estimate.
  Merged,
  /// The frame's noise looks statistically different from the accumulated
  /// history; the latest state is valid but the combined state was left
  /// untouched.
  DifferentNoiseType,
}

#[derive(Clone, Debug)]
pub(crate) struct NoiseState {
  pub eqns: EquationSystem,
  pub strength_solver: NoiseStrengthSolver,
  /// Gain of the AR filter implied by the fitted coefficients, always >= 1.
  pub ar_gain: f64,
  pub num_observations: usize,
}

impl NoiseState {
  fn new(n: usize, bit_depth: usize) -> Self {
    Self {
      eqns: EquationSystem::new(n),
      strength_solver: NoiseStrengthSolver::new(NUM_BINS, bit_depth),
      ar_gain: 1.0,
      num_observations: 0,
    }
  }

  fn copy_from(&mut self, src: &NoiseState) {
    self.eqns.copy_from(&src.eqns);
    self.strength_solver = src.strength_solver.clone();
    self.ar_gain = src.ar_gain;
    self.num_observations = src.num_observations;
  }

  fn clear(&mut self) {
    self.eqns.clear();
    self.strength_solver.clear();
    self.ar_gain = 1.0;
    self.num_observations = 0;
  }
}

/// Per-session noise model: three channels of latest/combined state plus the
/// shared AR neighborhood.
pub struct NoiseModel {
  params: NoiseModelParams,
  /// Number of AR coefficients (excluding the chroma correlation column).
  n: usize,
  coords: Vec<(i32, i32)>,
  latest: [NoiseState; 3],
  combined: [NoiseState; 3],
}

fn num_coeffs(params: NoiseModelParams) -> usize {
  let n = 2 * params.lag + 1;
  match params.shape {
    NoiseShape::Diamond => params.lag * (params.lag + 1),
    NoiseShape::Square => (n * n) / 2,
  }
}

impl NoiseModel {
  pub fn new(params: NoiseModelParams) -> Result<Self, NoiseModelError> {
    if params.lag < 1 || params.lag > MAX_LAG {
      return Err(NoiseModelError::InvalidLag { lag: params.lag });
    }
    let n = num_coeffs(params);
    let lag = params.lag as i32;

    let mut coords = Vec::with_capacity(n);
    for y in -lag..=0 {
      let max_x = if y == 0 { -1 } else { lag };
      for x in -lag..=max_x {
        match params.shape {
          NoiseShape::Diamond => {
            if x.abs() <= y + lag {
              coords.push((x, y));
            }
          }
          NoiseShape::Square => coords.push((x, y)),
        }
      }
    }
    assert_eq!(coords.len(), n);

    let state =
      |extra: usize| NoiseState::new(n + extra, params.bit_depth);
    Ok(Self {
      params,
      n,
      coords,
      latest: [state(0), state(1), state(1)],
      combined: [state(0), state(1), state(1)],
    })
  }

  pub const fn params(&self) -> &NoiseModelParams {
    &self.params
  }

  /// Updates the model from a source/denoised frame pair.
  ///
  /// `data` and `denoised` hold 1 (luma only) or 3 planes of identical
  /// geometry; `flat_blocks` is the raster-order mask produced by
  /// [`FlatBlockFinder::run`] for the same `block_size`.
  ///
  /// [`FlatBlockFinder::run`]: crate::flat::FlatBlockFinder::run
  pub fn update<T: Pixel>(
    &mut self, data: &[Plane<T>], denoised: &[Plane<T>], flat_blocks: &[u8],
    block_size: usize,
  ) -> Result<NoiseModelUpdate, NoiseModelError> {
    assert!(!data.is_empty() && data.len() <= 3);
    assert_eq!(data.len(), denoised.len());
    if block_size <= 1 || block_size < self.params.lag * 2 + 1 {
      return Err(NoiseModelError::InvalidBlockSize { block_size });
    }

    let w = data[0].cfg.width;
    let h = data[0].cfg.height;
    let num_blocks_w = (w + block_size - 1) / block_size;
    let num_blocks_h = (h + block_size - 1) / block_size;
    assert_eq!(flat_blocks.len(), num_blocks_w * num_blocks_h);

    for state in self.latest.iter_mut() {
      state.eqns.clear();
      state.num_observations = 0;
      state.strength_solver.clear();
    }

    let num_blocks = flat_blocks.iter().filter(|&&b| b != 0).count();
    if num_blocks <= 1 {
      debug!("not enough flat blocks to update the noise estimate");
      return Err(NoiseModelError::InsufficientFlatBlocks {
        found: num_blocks,
      });
    }

    let mut y_model_different = false;
    for channel in 0..data.len() {
      let is_chroma = channel > 0;
      let sub = if is_chroma {
        (data[channel].cfg.xdec, data[channel].cfg.ydec)
      } else {
        (0, 0)
      };

      add_block_observations(
        &self.coords,
        self.params.lag,
        self.params.bit_depth,
        &mut self.latest[channel],
        &data[channel],
        &denoised[channel],
        is_chroma.then(|| (&data[0], &denoised[0])),
        sub,
        flat_blocks,
        block_size,
        num_blocks_w,
        num_blocks_h,
      );

      if !ar_equation_system_solve(&mut self.latest[channel], is_chroma) {
        if is_chroma {
          chroma_coefficient_fallback(&mut self.latest[channel].eqns);
        } else {
          warn!("solving the latest luma AR system failed");
          return Err(NoiseModelError::SolverFailure("latest luma AR"));
        }
      }

      {
        let (luma, rest) = self.latest.split_at_mut(1);
        let (state, luma_info) = if is_chroma {
          (
            &mut rest[channel - 1],
            Some((&luma[0].strength_solver, luma[0].ar_gain)),
          )
        } else {
          (&mut luma[0], None)
        };
        let NoiseState { eqns, strength_solver, ar_gain, .. } = state;
        add_noise_std_observations(
          strength_solver,
          &eqns.x,
          self.n,
          *ar_gain,
          luma_info,
          &data[channel],
          &denoised[channel],
          is_chroma.then(|| &data[0]),
          sub,
          flat_blocks,
          block_size,
          num_blocks_w,
          num_blocks_h,
        );
        if !strength_solver.solve() {
          return Err(NoiseModelError::SolverFailure("latest noise strength"));
        }
      }

      if channel == 0
        && self.combined[0].strength_solver.num_equations() > 0
        && self.is_noise_model_different()
      {
        debug!("luma noise diverged from history; pausing accumulation");
        y_model_different = true;
      }
      if y_model_different {
        continue;
      }

      self.combined[channel].eqns.add_assign(&self.latest[channel].eqns);
      self.combined[channel].num_observations +=
        self.latest[channel].num_observations;
      if !ar_equation_system_solve(&mut self.combined[channel], is_chroma) {
        if is_chroma {
          chroma_coefficient_fallback(&mut self.combined[channel].eqns);
        } else {
          warn!("solving the combined luma AR system failed");
          return Err(NoiseModelError::SolverFailure("combined luma AR"));
        }
      }

      self.combined[channel]
        .strength_solver
        .add_assign(&self.latest[channel].strength_solver);
      if !self.combined[channel].strength_solver.solve() {
        return Err(NoiseModelError::SolverFailure("combined noise strength"));
      }
    }

    Ok(if y_model_different {
      NoiseModelUpdate::DifferentNoiseType
    } else {
      NoiseModelUpdate::Merged
    })
  }

  /// Force-accepts the latest single-frame estimate as the combined state,
  /// then clears the latest state. Used on the first frame of a shot.
  pub fn save_latest(&mut self) {
    for c in 0..3 {
      self.combined[c].copy_from(&self.latest[c]);
      self.latest[c].clear();
    }
  }

  /// True when the latest luma estimate no longer matches the combined one,
  /// either because the AR coefficients decorrelated or because the strength
  /// curves drifted apart.
  fn is_noise_model_different(&self) -> bool {
    const COEFF_THRESHOLD: f64 = 0.9;
    let strength_threshold =
      0.005 * (1usize << (self.params.bit_depth - 8)) as f64;

    let latest = &self.latest[0];
    let combined = &self.combined[0];
    let corr =
      normalized_cross_correlation(&latest.eqns.x, &combined.eqns.x);
    if corr < COEFF_THRESHOLD {
      return true;
    }

    let n = latest.strength_solver.num_bins();
    let dx = 1.0 / n as f64;
    let latest_eqns = &latest.strength_solver.eqns;
    let combined_eqns = &combined.strength_solver.eqns;
    let mut diff = 0.0;
    let mut total_weight = 0.0;
    for j in 0..n {
      // Confidence of bin j is the (sqrt of the) mass it accumulated.
      let weight: f64 =
        (0..n).map(|i| latest_eqns.a[i * n + j]).sum::<f64>().sqrt();
      diff += weight * (latest_eqns.x[j] - combined_eqns.x[j]).abs();
      total_weight += weight;
    }
    diff * dx / total_weight > strength_threshold
  }

  /// Converts the combined state into the fixed-point grain synthesis
  /// parameter set consumed by the downstream film-grain stage.
  pub fn grain_parameters(&self) -> Result<GrainParams, NoiseModelError> {
    if self.params.lag > 3 {
      return Err(NoiseModelError::InvalidLag { lag: self.params.lag });
    }
    let mut params = GrainParams {
      ar_coeff_lag: self.params.lag as u8,
      ..GrainParams::default()
    };

    // Scaling curves: both domain and range are normalized to 8-bit space,
    // with a power-of-two shift chosen so the largest value fills [0, 255].
    let luts = [
      self.combined[0].strength_solver.fit_piecewise(14),
      self.combined[1].strength_solver.fit_piecewise(10),
      self.combined[2].strength_solver.fit_piecewise(10),
    ];
    let strength_divisor = (1usize << (self.params.bit_depth - 8)) as f64;
    let mut max_scaling_value = 1e-4f64;
    let scaled: Vec<Vec<(f64, f64)>> = luts
      .iter()
      .map(|lut| {
        lut
          .points
          .iter()
          .map(|&(x, y)| {
            let y = (y / strength_divisor).min(255.0);
            max_scaling_value = max_scaling_value.max(y);
            ((x / strength_divisor).min(255.0), y)
          })
          .collect()
      })
      .collect();

    let max_scaling_log2 =
      ((max_scaling_value.log2() + 1.0).floor() as i32).clamp(2, 5);
    params.scaling_shift = (5 + (8 - max_scaling_log2)) as u8;
    let scale_factor = f64::from(1 << (8 - max_scaling_log2));
    for (c, points) in scaled.iter().enumerate() {
      for &(x, y) in points {
        let point = [
          (x + 0.5) as u8,
          (scale_factor * y + 0.5).clamp(0.0, 255.0) as u8,
        ];
        match c {
          0 => params.scaling_points_y.push(point),
          1 => params.scaling_points_cb.push(point),
          _ => params.scaling_points_cr.push(point),
        }
      }
    }

    // AR coefficients, rescaled to 8-bit fixed point. The chroma-to-luma
    // correlation was estimated in an already-scaled space, so fold it back
    // through the per-channel weighted average strengths first.
    let n_coeff = self.n;
    let mut max_coeff = 1e-4f64;
    let mut min_coeff = -1e-4f64;
    let mut y_corr = [0.0f64; 2];
    let mut avg_luma_strength = 1.0;
    for c in 0..3 {
      let eqns = &self.combined[c].eqns;
      for &x in eqns.x.iter().take(n_coeff) {
        max_coeff = max_coeff.max(x);
        min_coeff = min_coeff.min(x);
      }
      let solver = &self.combined[c].strength_solver;
      let n = solver.num_bins();
      let mut average_strength = 0.0;
      let mut total_weight = 0.0;
      for i in 0..n {
        let w: f64 =
          (0..n).map(|j| solver.eqns.a[i * n + j]).sum::<f64>().sqrt();
        average_strength += solver.eqns.x[i] * w;
        total_weight += w;
      }
      if total_weight == 0.0 {
        average_strength = 1.0;
      } else {
        average_strength /= total_weight;
      }
      if c == 0 {
        avg_luma_strength = average_strength;
      } else {
        y_corr[c - 1] =
          avg_luma_strength * eqns.x[n_coeff] / average_strength;
        max_coeff = max_coeff.max(y_corr[c - 1]);
        min_coeff = min_coeff.min(y_corr[c - 1]);
      }
    }

    // Shift in [6, 9]: 6 covers coefficients in [-2, 2), 9 in [-0.25, 0.25).
    let bound = (1.0 + max_coeff.log2().floor())
      .max((-min_coeff).log2().ceil()) as i32;
    params.ar_coeff_shift = (7 - bound).clamp(6, 9) as u8;
    let scale_ar_coeff = f64::from(1 << params.ar_coeff_shift);
    let quantize =
      |x: f64| (scale_ar_coeff * x).round().clamp(-128.0, 127.0) as i8;
    for c in 0..3 {
      let eqns = &self.combined[c].eqns;
      let coeffs: ArrayVec<i8, 25> = eqns
        .x
        .iter()
        .take(n_coeff)
        .map(|&x| quantize(x))
        .chain((c > 0).then(|| quantize(y_corr[c - 1])))
        .collect();
      match c {
        0 => params.ar_coeffs_y = coeffs.iter().copied().collect(),
        1 => params.ar_coeffs_cb = coeffs,
        _ => params.ar_coeffs_cr = coeffs,
      }
    }

    // The chroma scaling curves are expressed as functions of luma.
    params.cb_mult = 128;
    params.cb_luma_mult = 192;
    params.cb_offset = 256;
    params.cr_mult = 128;
    params.cr_luma_mult = 192;
    params.cr_offset = 256;
    params.chroma_scaling_from_luma = false;
    params.grain_scale_shift = 0;
    params.overlap_flag = true;
    Ok(params)
  }
}

/// Grain synthesis parameters in the fixed-point representation consumed by
/// a film-grain synthesis stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrainParams {
  pub scaling_points_y: ArrayVec<[u8; 2], 14>,
  pub scaling_points_cb: ArrayVec<[u8; 2], 10>,
  pub scaling_points_cr: ArrayVec<[u8; 2], 10>,
  /// Scaling curve shift, in `[8, 11]`.
  pub scaling_shift: u8,
  pub ar_coeff_lag: u8,
  pub ar_coeffs_y: ArrayVec<i8, 24>,
  pub ar_coeffs_cb: ArrayVec<i8, 25>,
  pub ar_coeffs_cr: ArrayVec<i8, 25>,
  /// AR coefficient shift, in `[6, 9]`.
  pub ar_coeff_shift: u8,
  pub cb_mult: u8,
  pub cb_luma_mult: u8,
  pub cb_offset: u16,
  pub cr_mult: u8,
  pub cr_luma_mult: u8,
  pub cr_offset: u16,
  pub overlap_flag: bool,
  pub chroma_scaling_from_luma: bool,
  pub grain_scale_shift: u8,
}

fn sample_diff<T: Pixel>(
  data: &Plane<T>, denoised: &Plane<T>, x: usize, y: usize,
) -> f64 {
  f64::from(u32::cast_from(data.p(x, y)))
    - f64::from(u32::cast_from(denoised.p(x, y)))
}

/// Accumulates AR neighborhood observations from every flat block into the
/// channel's latest equation system.
#[allow(clippy::too_many_arguments)]
fn add_block_observations<T: Pixel>(
  coords: &[(i32, i32)], lag: usize, bit_depth: usize, state: &mut NoiseState,
  data: &Plane<T>, denoised: &Plane<T>,
  alt: Option<(&Plane<T>, &Plane<T>)>, sub: (usize, usize),
  flat_blocks: &[u8], block_size: usize, num_blocks_w: usize,
  num_blocks_h: usize,
) {
  let num_coords = coords.len();
  let n = state.eqns.n;
  let normalization = ((1usize << bit_depth) - 1) as f64;
  let norm_sq = normalization * normalization;
  let mut buffer = vec![0.0; num_coords + 1];

  let bs_x = block_size >> sub.0;
  let bs_y = block_size >> sub.1;
  let plane_w = data.cfg.width;
  let plane_h = data.cfg.height;

  for by in 0..num_blocks_h {
    let y_o = by * bs_y;
    for bx in 0..num_blocks_w {
      let x_o = bx * bs_x;
      if flat_blocks[by * num_blocks_w + bx] == 0 {
        continue;
      }
      // Start past the AR reach unless the neighbor block is flat too, so
      // the neighborhood never straddles textured content.
      let y_start = if by > 0 && flat_blocks[(by - 1) * num_blocks_w + bx] != 0
      {
        0
      } else {
        lag
      };
      let x_start = if bx > 0 && flat_blocks[by * num_blocks_w + bx - 1] != 0 {
        0
      } else {
        lag
      };
      let y_end = plane_h.saturating_sub(y_o).min(bs_y);
      let flat_right =
        bx + 1 < num_blocks_w && flat_blocks[by * num_blocks_w + bx + 1] != 0;
      let x_end = (plane_w as isize - x_o as isize - lag as isize).min(
        if flat_right { bs_x as isize } else { bs_x as isize - lag as isize },
      );

      for y in y_start..y_end {
        for x in x_start as isize..x_end {
          let px = (x as usize) + x_o;
          let py = y + y_o;
          for (i, &(cx, cy)) in coords.iter().enumerate() {
            let xi = (px as i32 + cx) as usize;
            let yi = (py as i32 + cy) as usize;
            buffer[i] = sample_diff(data, denoised, xi, yi);
          }
          let val = sample_diff(data, denoised, px, py);
          if let Some((alt_data, alt_denoised)) = alt {
            let mut avg = 0.0;
            let mut num_samples = 0usize;
            for dy in 0..1 << sub.1 {
              let y_up = (py << sub.1) + dy;
              for dx in 0..1 << sub.0 {
                let x_up = (px << sub.0) + dx;
                avg += sample_diff(alt_data, alt_denoised, x_up, y_up);
                num_samples += 1;
              }
            }
            buffer[num_coords] = avg / num_samples as f64;
          }

          for i in 0..n {
            for j in 0..n {
              state.eqns.a[i * n + j] += buffer[i] * buffer[j] / norm_sq;
            }
            state.eqns.b[i] += buffer[i] * val / norm_sq;
          }
          state.num_observations += 1;
        }
      }
    }
  }
}

fn block_mean<T: Pixel>(
  plane: &Plane<T>, x_o: usize, y_o: usize, block_size: usize,
) -> f64 {
  let max_h = (plane.cfg.height - y_o).min(block_size);
  let max_w = (plane.cfg.width - x_o).min(block_size);
  let mut sum = 0.0;
  for y in 0..max_h {
    for x in 0..max_w {
      sum += f64::from(u32::cast_from(plane.p(x_o + x, y_o + y)));
    }
  }
  sum / (max_w * max_h) as f64
}

fn block_noise_var<T: Pixel>(
  data: &Plane<T>, denoised: &Plane<T>, x_o: usize, y_o: usize,
  block_size_x: usize, block_size_y: usize,
) -> f64 {
  let max_h = (data.cfg.height - y_o).min(block_size_y);
  let max_w = (data.cfg.width - x_o).min(block_size_x);
  let mut noise_var = 0.0;
  for y in 0..max_h {
    for x in 0..max_w {
      let noise = sample_diff(data, denoised, x_o + x, y_o + y);
      noise_var += noise * noise;
    }
  }
  noise_var / (max_w * max_h - 1) as f64
}

/// Feeds per-block `(mean, adjusted sigma)` pairs into the channel's
/// strength solver, removing the part of chroma noise explained by luma
/// correlation and undoing the AR filter gain.
#[allow(clippy::too_many_arguments)]
fn add_noise_std_observations<T: Pixel>(
  strength_solver: &mut NoiseStrengthSolver, coeffs: &[f64],
  num_coords: usize, noise_gain: f64,
  luma: Option<(&NoiseStrengthSolver, f64)>, data: &Plane<T>,
  denoised: &Plane<T>, alt_data: Option<&Plane<T>>, sub: (usize, usize),
  flat_blocks: &[u8], block_size: usize, num_blocks_w: usize,
  num_blocks_h: usize,
) {
  let bs_x = block_size >> sub.0;
  let bs_y = block_size >> sub.1;

  for by in 0..num_blocks_h {
    let y_o = by * bs_y;
    for bx in 0..num_blocks_w {
      let x_o = bx * bs_x;
      if flat_blocks[by * num_blocks_w + bx] == 0 {
        continue;
      }
      let num_samples_h = data.cfg.height.saturating_sub(y_o).min(bs_y);
      let num_samples_w = data.cfg.width.saturating_sub(x_o).min(bs_x);
      // Blocks clipped down to a sliver give unreliable variance.
      if num_samples_w * num_samples_h <= block_size {
        continue;
      }
      let mean_plane = alt_data.unwrap_or(data);
      let mean = block_mean(
        mean_plane,
        x_o << sub.0,
        y_o << sub.1,
        block_size,
      );
      let noise_var = block_noise_var(data, denoised, x_o, y_o, bs_x, bs_y);

      // Chroma noise decomposes as
      //   N(0, noise_var) = N(0, uncorr_var) + corr * N(0, luma_strength^2)
      // so remove the correlated component before fitting the curve.
      let (luma_strength, corr) = match luma {
        Some((luma_solver, luma_gain)) => {
          (luma_gain * luma_solver.get_value(mean), coeffs[num_coords])
        }
        None => (0.0, 0.0),
      };
      let uncorr_std = (noise_var / 16.0)
        .max(noise_var - (corr * luma_strength).powi(2))
        .sqrt();
      // Undo the gain the AR filter will add back at synthesis time.
      let adjusted_strength = uncorr_std / noise_gain;
      strength_solver.add_measurement(mean, adjusted_strength);
    }
  }
}

/// Solves a channel's AR system and derives the filter gain from the ratio
/// of total to uncorrelated noise variance.
fn ar_equation_system_solve(state: &mut NoiseState, is_chroma: bool) -> bool {
  let solved = state.eqns.solve();
  state.ar_gain = 1.0;
  if !solved {
    return false;
  }

  // In the Yule-Walker formulation the diagonal carries the variance of the
  // correlated noise; the least-squares estimate jitters across the
  // diagonal, so use its mean.
  let n = state.eqns.n;
  let is_c = is_chroma as usize;
  let observations = state.num_observations as f64;
  let mut var = 0.0;
  for i in 0..n - is_c {
    var += state.eqns.a[i * n + i] / observations;
  }
  var /= (n - is_c) as f64;

  // E(Y^2) = <b, x>; with a luma correlation column, subtract its scaled
  // contribution first: E(y^2) = <b - A[:, end] * x[end], x>.
  let mut sum_covar = 0.0;
  for i in 0..n - is_c {
    let mut bi = state.eqns.b[i];
    if is_chroma {
      bi -= state.eqns.a[i * n + (n - 1)] * state.eqns.x[n - 1];
    }
    sum_covar += bi * state.eqns.x[i] / observations;
  }

  let noise_var = (var - sum_covar).max(1e-6);
  state.ar_gain = (var / noise_var).max(1e-6).sqrt().max(1.0);
  true
}

/// Degenerate chroma solution: zero AR coefficients, keeping only the luma
/// correlation term when its diagonal entry is usable.
fn chroma_coefficient_fallback(eqns: &mut EquationSystem) {
  const TOLERANCE: f64 = 1e-6;
  let n = eqns.n;
  let last = n - 1;
  eqns.x.iter_mut().for_each(|x| *x = 0.0);
  if eqns.a[last * n + last].abs() > TOLERANCE {
    eqns.x[last] = eqns.b[last] / eqns.a[last * n + last];
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::flat::FlatBlockFinder;
  use rand::SeedableRng;
  use rand_chacha::ChaChaRng;
  use rand_distr::{Distribution, Normal};

  fn default_params() -> NoiseModelParams {
    NoiseModelParams { shape: NoiseShape::Square, lag: 2, bit_depth: 8 }
  }

  fn fill_constant(plane: &mut Plane<u8>, value: u8) {
    let w = plane.cfg.width;
    for row in plane.mut_slice(Default::default()).rows_iter_mut() {
      row[..w].iter_mut().for_each(|px| *px = value);
    }
  }

  /// A constant luma plane plus seeded Gaussian noise, with its clean copy.
  fn noisy_pair(
    w: usize, h: usize, value: u8, sigma: f64, seed: u64,
  ) -> (Plane<u8>, Plane<u8>) {
    let mut rng = ChaChaRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    let mut denoised = Plane::new(w, h, 0, 0, 0, 0);
    fill_constant(&mut denoised, value);
    let mut data = Plane::new(w, h, 0, 0, 0, 0);
    for row in data.mut_slice(Default::default()).rows_iter_mut() {
      for px in row.iter_mut().take(w) {
        let v = f64::from(value) + normal.sample(&mut rng);
        *px = v.round().clamp(0.0, 255.0) as u8;
      }
    }
    (data, denoised)
  }

  #[test]
  fn rejects_invalid_lag() {
    let params =
      NoiseModelParams { shape: NoiseShape::Diamond, lag: 5, bit_depth: 8 };
    assert_eq!(
      NoiseModel::new(params).err(),
      Some(NoiseModelError::InvalidLag { lag: 5 })
    );
  }

  #[test]
  fn rejects_invalid_block_size() {
    let mut model = NoiseModel::new(default_params()).unwrap();
    let (data, denoised) = noisy_pair(32, 32, 128, 2.0, 1);
    let err = model.update(&[data], &[denoised], &[255], 1).unwrap_err();
    assert_eq!(err, NoiseModelError::InvalidBlockSize { block_size: 1 });
  }

  #[test]
  fn rejects_insufficient_flat_blocks() {
    let mut model = NoiseModel::new(default_params()).unwrap();
    let (data, denoised) = noisy_pair(64, 64, 128, 2.0, 2);
    let mut mask = vec![0u8; 4];
    mask[0] = 255;
    let err =
      model.update(&[data], &[denoised], &mask, 32).unwrap_err();
    assert_eq!(err, NoiseModelError::InsufficientFlatBlocks { found: 1 });
  }

  #[test]
  fn flat_frame_with_noise_updates_ok() {
    // A flat 64x64 frame: every 32x32 block is flat, so with 4 flat blocks
    // the update must succeed rather than report insufficient data.
    let (data, denoised) = noisy_pair(64, 64, 128, 2.0, 3);
    let finder = FlatBlockFinder::new(32, 8);
    let (mask, num_flat) = finder.run(&data);
    assert_eq!(num_flat, 4);

    let mut model = NoiseModel::new(default_params()).unwrap();
    let status = model.update(&[data], &[denoised], &mask, 32).unwrap();
    assert_eq!(status, NoiseModelUpdate::Merged);
    assert!(model.latest[0].num_observations > 0);
  }

  #[test]
  fn ar_gain_lower_bound() {
    let (data, denoised) = noisy_pair(128, 128, 100, 4.0, 4);
    let finder = FlatBlockFinder::new(32, 8);
    let (mask, _) = finder.run(&data);
    let mut model = NoiseModel::new(default_params()).unwrap();
    model.update(&[data], &[denoised], &mask, 32).unwrap();
    assert!(model.latest[0].ar_gain >= 1.0);
    assert!(model.combined[0].ar_gain >= 1.0);
  }

  #[test]
  fn identical_updates_never_diverge() {
    let (data, denoised) = noisy_pair(128, 128, 128, 3.0, 5);
    let finder = FlatBlockFinder::new(32, 8);
    let (mask, _) = finder.run(&data);
    let mut model = NoiseModel::new(default_params()).unwrap();
    for _ in 0..3 {
      let status = model
        .update(&[data.clone()], &[denoised.clone()], &mask, 32)
        .unwrap();
      assert_eq!(status, NoiseModelUpdate::Merged);
    }
    // With latest equal to combined, self-comparison must not flag a
    // different noise type.
    assert!(!model.is_noise_model_different());
  }

  #[test]
  fn save_latest_copies_state() {
    let (data, denoised) = noisy_pair(128, 128, 128, 3.0, 6);
    let finder = FlatBlockFinder::new(32, 8);
    let (mask, _) = finder.run(&data);
    let mut model = NoiseModel::new(default_params()).unwrap();
    model.update(&[data], &[denoised], &mask, 32).unwrap();

    let gain = model.latest[0].ar_gain;
    let observations = model.latest[0].num_observations;
    model.save_latest();
    assert_eq!(model.combined[0].ar_gain, gain);
    assert_eq!(model.combined[0].num_observations, observations);
    assert_eq!(model.latest[0].num_observations, 0);
  }

  #[test]
  fn grain_parameters_shape() {
    let (data, denoised) = noisy_pair(128, 128, 128, 4.0, 7);
    let finder = FlatBlockFinder::new(32, 8);
    let (mask, _) = finder.run(&data);
    let mut model = NoiseModel::new(default_params()).unwrap();
    model.update(&[data], &[denoised], &mask, 32).unwrap();

    let params = model.grain_parameters().unwrap();
    assert_eq!(params.ar_coeff_lag, 2);
    assert_eq!(params.ar_coeffs_y.len(), num_coeffs(default_params()));
    assert_eq!(params.ar_coeffs_cb.len(), num_coeffs(default_params()) + 1);
    assert!((6..=9).contains(&params.ar_coeff_shift));
    assert!((8..=11).contains(&params.scaling_shift));
    assert!(params.scaling_points_y.len() <= 14);
    assert!(params.scaling_points_y.len() >= 2);
    assert!(params.overlap_flag);
  }

  #[test]
  fn grain_parameters_reject_large_lag() {
    let params =
      NoiseModelParams { shape: NoiseShape::Diamond, lag: 4, bit_depth: 8 };
    let model = NoiseModel::new(params).unwrap();
    assert!(model.grain_parameters().is_err());
  }

  #[test]
  fn chroma_correlation_recovered() {
    // Chroma noise equal to downsampled luma noise should produce a strong
    // correlation coefficient in the chroma channel.
    let mut rng = ChaChaRng::seed_from_u64(8);
    let normal = Normal::new(0.0, 4.0).unwrap();
    let (w, h) = (128, 128);
    let mut y_data = Plane::<u8>::new(w, h, 0, 0, 0, 0);
    let mut y_denoised = Plane::<u8>::new(w, h, 0, 0, 0, 0);
    fill_constant(&mut y_data, 128);
    fill_constant(&mut y_denoised, 128);
    let mut u_data = Plane::<u8>::new(w / 2, h / 2, 1, 1, 0, 0);
    let mut u_denoised = Plane::<u8>::new(w / 2, h / 2, 1, 1, 0, 0);
    fill_constant(&mut u_data, 128);
    fill_constant(&mut u_denoised, 128);
    let v_data = u_data.clone();
    let v_denoised = u_denoised.clone();

    let mut noise = vec![0f64; (w / 2) * (h / 2)];
    for v in noise.iter_mut() {
      *v = normal.sample(&mut rng);
    }
    for (y, row) in
      y_data.mut_slice(Default::default()).rows_iter_mut().enumerate()
    {
      for x in 0..w {
        let n = noise[(y / 2) * (w / 2) + x / 2];
        row[x] = (128.0 + n).round().clamp(0.0, 255.0) as u8;
      }
    }
    for (y, row) in
      u_data.mut_slice(Default::default()).rows_iter_mut().enumerate()
    {
      for x in 0..w / 2 {
        let n = noise[y * (w / 2) + x];
        row[x] = (128.0 + n).round().clamp(0.0, 255.0) as u8;
      }
    }

    let finder = FlatBlockFinder::new(32, 8);
    let (mask, _) = finder.run(&y_data);
    let mut model = NoiseModel::new(default_params()).unwrap();
    model
      .update(
        &[y_data, u_data, v_data],
        &[y_denoised, u_denoised, v_denoised],
        &mask,
        32,
      )
      .unwrap();

    let n = model.n;
    let corr = model.latest[1].eqns.x[n];
    assert!(corr > 0.5, "expected strong chroma-luma correlation, got {corr}");
  }
}
