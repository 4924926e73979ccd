// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Noise strength as a function of intensity.
//!
//! Film grain is rarely uniform across the tonal range, so per-block
//! `(mean intensity, noise sigma)` measurements are fitted to a 1-D curve
//! over a histogram of intensity bins. The fitted curve is later thinned
//! into the compact piecewise-linear lookup table carried by the grain
//! parameters.

use crate::math::EquationSystem;

use log::warn;

/// Weighted least-squares fit of noise standard deviation over intensity
/// bins, with Laplacian smoothing so sparsely observed bins follow their
/// neighbors.
#[derive(Clone, Debug)]
pub struct NoiseStrengthSolver {
  pub(crate) eqns: EquationSystem,
  num_bins: usize,
  min_intensity: f64,
  max_intensity: f64,
  pub(crate) total: f64,
  pub(crate) num_equations: usize,
}

impl NoiseStrengthSolver {
  pub fn new(num_bins: usize, bit_depth: usize) -> Self {
    assert!(num_bins >= 2);
    Self {
      eqns: EquationSystem::new(num_bins),
      num_bins,
      min_intensity: 0.0,
      max_intensity: ((1usize << bit_depth) - 1) as f64,
      total: 0.0,
      num_equations: 0,
    }
  }

  pub const fn num_bins(&self) -> usize {
    self.num_bins
  }

  pub const fn num_equations(&self) -> usize {
    self.num_equations
  }

  pub fn clear(&mut self) {
    self.eqns.clear();
    self.total = 0.0;
    self.num_equations = 0;
  }

  /// Merges the observations of `src` into this solver.
  pub fn add_assign(&mut self, src: &NoiseStrengthSolver) {
    self.eqns.add_assign(&src.eqns);
    self.num_equations += src.num_equations;
    self.total += src.total;
  }

  fn bin_index(&self, value: f64) -> f64 {
    let val = value.clamp(self.min_intensity, self.max_intensity);
    let range = self.max_intensity - self.min_intensity;
    (self.num_bins - 1) as f64 * (val - self.min_intensity) / range
  }

  /// Intensity at the center of bin `i`.
  pub fn bin_center(&self, i: usize) -> f64 {
    let range = self.max_intensity - self.min_intensity;
    i as f64 / (self.num_bins - 1) as f64 * range + self.min_intensity
  }

  /// Soft-bins one `(block mean, noise sigma)` measurement into the two
  /// nearest histogram bins with linear interpolation weights.
  pub fn add_measurement(&mut self, block_mean: f64, noise_std: f64) {
    let bin = self.bin_index(block_mean);
    let bin_i0 = bin.floor() as usize;
    let bin_i1 = (bin_i0 + 1).min(self.num_bins - 1);
    let a = bin - bin_i0 as f64;
    let n = self.num_bins;
    let eqns = &mut self.eqns;
    eqns.a[bin_i0 * n + bin_i0] += (1.0 - a) * (1.0 - a);
    eqns.a[bin_i1 * n + bin_i0] += a * (1.0 - a);
    eqns.a[bin_i1 * n + bin_i1] += a * a;
    eqns.a[bin_i0 * n + bin_i1] += a * (1.0 - a);
    eqns.b[bin_i0] += (1.0 - a) * noise_std;
    eqns.b[bin_i1] += a * noise_std;
    self.total += noise_std;
    self.num_equations += 1;
  }

  /// Solves the regularized system. The accumulated observations are left
  /// untouched; only the per-bin solution is updated.
  pub fn solve(&mut self) -> bool {
    let n = self.num_bins;
    // Curvature penalty proportional to the number of constraints.
    let alpha = self.num_equations as f64 / n as f64;
    let mut reg = self.eqns.clone();

    for i in 0..n {
      let i_lo = i.saturating_sub(1);
      let i_hi = (i + 1).min(n - 1);
      reg.a[i * n + i_lo] -= alpha;
      reg.a[i * n + i] += 2.0 * alpha;
      reg.a[i * n + i_hi] -= alpha;
    }

    // A small ridge pulls unobserved bins toward the mean noise strength.
    let mean = if self.num_equations > 0 {
      self.total / self.num_equations as f64
    } else {
      0.0
    };
    for i in 0..n {
      reg.a[i * n + i] += 1.0 / 18192.0;
      reg.b[i] += mean / 18192.0;
    }

    if !reg.solve() {
      warn!("noise strength system is singular");
      return false;
    }
    self.eqns.set_solution(reg.solution());
    true
  }

  /// Evaluates the solved curve at intensity `x` by bilinear interpolation
  /// over the bin values.
  pub fn get_value(&self, x: f64) -> f64 {
    let bin = self.bin_index(x);
    let bin_i0 = bin.floor() as usize;
    let bin_i1 = (bin_i0 + 1).min(self.num_bins - 1);
    let a = bin - bin_i0 as f64;
    (1.0 - a) * self.eqns.x[bin_i0] + a * self.eqns.x[bin_i1]
  }

  /// Simplifies the solved curve into at most `max_output_points` knots.
  ///
  /// Starts from one point per bin and greedily removes the interior point
  /// whose removal changes the curve least, until the table fits the output
  /// budget and every remaining point carries more than a bit-depth
  /// normalized residual tolerance.
  pub fn fit_piecewise(&self, max_output_points: usize) -> NoiseStrengthLut {
    let tolerance = self.max_intensity * 0.00625 / 255.0;
    let mut lut = NoiseStrengthLut {
      points: (0..self.num_bins)
        .map(|i| (self.bin_center(i), self.eqns.x[i]))
        .collect(),
    };

    let mut residual = vec![0.0; self.num_bins];
    self.update_piecewise_residual(&lut, &mut residual, 0, self.num_bins);

    while lut.points.len() > 2 {
      let mut min_index = 1;
      for j in 1..lut.points.len() - 1 {
        if residual[j] < residual[min_index] {
          min_index = j;
        }
      }
      let dx = lut.points[min_index + 1].0 - lut.points[min_index - 1].0;
      let avg_residual = residual[min_index] / dx;
      if lut.points.len() <= max_output_points && avg_residual > tolerance {
        break;
      }
      lut.points.remove(min_index);
      residual.remove(min_index);
      self.update_piecewise_residual(
        &lut,
        &mut residual,
        min_index.saturating_sub(1),
        min_index + 1,
      );
    }
    lut
  }

  /// Recomputes, for each interior point in `[start, end)`, the area between
  /// the solved curve and the segment joining the point's neighbors.
  fn update_piecewise_residual(
    &self, lut: &NoiseStrengthLut, residual: &mut [f64], start: usize,
    end: usize,
  ) {
    let dx = 255.0 / self.num_bins as f64;
    for i in start.max(1)..end.min(lut.points.len() - 1) {
      let (x_prev, y_prev) = lut.points[i - 1];
      let (x_next, y_next) = lut.points[i + 1];
      let lower = self.bin_index(x_prev).floor() as usize;
      let upper =
        (self.bin_index(x_next).ceil() as usize).min(self.num_bins - 1);
      let mut r = 0.0;
      for j in lower..=upper {
        let x = self.bin_center(j);
        if x < x_prev || x >= x_next {
          continue;
        }
        let y = self.eqns.x[j];
        let a = (x - x_prev) / (x_next - x_prev);
        let estimate_y = y_prev * (1.0 - a) + y_next * a;
        r += (y - estimate_y).abs();
      }
      residual[i] = r * dx;
    }
  }
}

/// Piecewise-linear noise-strength lookup table: `(intensity, sigma)` knots
/// ordered by intensity. Always retains at least its two endpoints.
#[derive(Clone, Debug, Default)]
pub struct NoiseStrengthLut {
  pub points: Vec<(f64, f64)>,
}

impl NoiseStrengthLut {
  pub fn num_points(&self) -> usize {
    self.points.len()
  }

  /// Linear interpolation between bracketing knots; constant extrapolation
  /// outside the knot range.
  pub fn eval(&self, x: f64) -> f64 {
    let points = &self.points;
    if x < points[0].0 {
      return points[0].1;
    }
    for i in 0..points.len() - 1 {
      if x >= points[i].0 && x <= points[i + 1].0 {
        let a = (x - points[i].0) / (points[i + 1].0 - points[i].0);
        return points[i + 1].1 * a + points[i].1 * (1.0 - a);
      }
    }
    points[points.len() - 1].1
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn repeated_measurement_dominates_curve() {
    let mut solver = NoiseStrengthSolver::new(4, 8);
    for _ in 0..100 {
      solver.add_measurement(0.0, 10.0);
    }
    assert!(solver.solve());
    // The observed bin hits the measurement, and the ridge pulls the
    // unobserved end of the curve toward the global mean (also 10).
    assert!((solver.get_value(0.0) - 10.0).abs() < 0.5);
    assert!((solver.get_value(255.0) - 10.0).abs() < 0.5);
  }

  #[test]
  fn solve_preserves_observations() {
    let mut solver = NoiseStrengthSolver::new(8, 8);
    solver.add_measurement(30.0, 2.0);
    solver.add_measurement(200.0, 6.0);
    let a_before = solver.eqns.a.clone();
    let b_before = solver.eqns.b.clone();
    assert!(solver.solve());
    assert_eq!(solver.eqns.a, a_before);
    assert_eq!(solver.eqns.b, b_before);
  }

  #[test]
  fn fit_piecewise_point_budget() {
    let mut solver = NoiseStrengthSolver::new(20, 8);
    for i in 0..1000 {
      let x = (i % 256) as f64;
      // Piecewise-ish profile with a knee at mid intensity.
      let sigma = if x < 128.0 { 2.0 + x / 64.0 } else { 4.0 };
      solver.add_measurement(x, sigma);
    }
    assert!(solver.solve());
    let full = solver.fit_piecewise(usize::MAX);
    assert_eq!(full.num_points(), 20);
    let lut = solver.fit_piecewise(6);
    assert!(lut.num_points() <= 6);
    assert!(lut.num_points() >= 2);
  }

  #[test]
  fn lut_eval_hits_surviving_knots() {
    let mut solver = NoiseStrengthSolver::new(10, 8);
    for i in 0..500 {
      let x = (i % 256) as f64;
      solver.add_measurement(x, 3.0 + x / 100.0);
    }
    assert!(solver.solve());
    let lut = solver.fit_piecewise(5);
    for &(x, y) in &lut.points {
      assert!((lut.eval(x) - y).abs() < 1e-12);
    }
    // Constant extrapolation outside the knot range.
    assert_eq!(lut.eval(-100.0), lut.points[0].1);
    assert_eq!(lut.eval(1e4), lut.points[lut.points.len() - 1].1);
  }
}
