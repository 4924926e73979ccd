// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Small dense linear systems used by the noise model.
//!
//! Both the AR coefficient estimation and the noise-strength curve fit
//! accumulate normal equations `A * x = b` observation by observation and
//! solve them in place. The systems involved are tiny (a few dozen unknowns
//! at most), so a pivoted Gaussian elimination is all that is needed.

/// An `n x n` system of normal equations together with its latest solution.
///
/// The accumulated `a` and `b` are never touched by [`solve`]: elimination
/// runs on scratch copies so callers can keep adding observations, or merge
/// two systems, after solving.
///
/// [`solve`]: EquationSystem::solve
#[derive(Clone, Debug)]
pub struct EquationSystem {
  pub(crate) n: usize,
  pub(crate) a: Vec<f64>,
  pub(crate) b: Vec<f64>,
  pub(crate) x: Vec<f64>,
}

impl EquationSystem {
  pub fn new(n: usize) -> Self {
    Self { n, a: vec![0.0; n * n], b: vec![0.0; n], x: vec![0.0; n] }
  }

  pub const fn size(&self) -> usize {
    self.n
  }

  /// The solution vector from the most recent successful [`solve`].
  ///
  /// [`solve`]: EquationSystem::solve
  pub fn solution(&self) -> &[f64] {
    &self.x
  }

  pub fn clear(&mut self) {
    self.a.iter_mut().for_each(|v| *v = 0.0);
    self.b.iter_mut().for_each(|v| *v = 0.0);
    self.x.iter_mut().for_each(|v| *v = 0.0);
  }

  pub fn copy_from(&mut self, src: &EquationSystem) {
    assert_eq!(self.n, src.n);
    self.a.copy_from_slice(&src.a);
    self.b.copy_from_slice(&src.b);
    self.x.copy_from_slice(&src.x);
  }

  /// Merges the accumulated observations of `src` into `self`.
  ///
  /// Used to fold a single update's statistics into the running
  /// multi-frame estimate; both systems must have the same size.
  pub fn add_assign(&mut self, src: &EquationSystem) {
    assert_eq!(self.n, src.n);
    for (dst, v) in self.a.iter_mut().zip(src.a.iter()) {
      *dst += v;
    }
    for (dst, v) in self.b.iter_mut().zip(src.b.iter()) {
      *dst += v;
    }
  }

  /// Solves `A * x = b` into the stored solution vector.
  ///
  /// Returns `false` when the system is singular; the previous solution is
  /// left untouched in that case and callers fall back to a degenerate
  /// parameterization.
  pub fn solve(&mut self) -> bool {
    let mut a = self.a.clone();
    let mut b = self.b.clone();
    linsolve(self.n, &mut a, &mut b, &mut self.x)
  }

  pub(crate) fn set_solution(&mut self, x: &[f64]) {
    self.x.copy_from_slice(x);
  }
}

/// Gaussian elimination with partial pivoting; `a` and `b` are clobbered.
fn linsolve(n: usize, a: &mut [f64], b: &mut [f64], x: &mut [f64]) -> bool {
  const PIVOT_EPS: f64 = 1e-10;

  for k in 0..n.saturating_sub(1) {
    // Bubble the largest-magnitude coefficient of this column onto the
    // diagonal.
    for i in (k + 1..n).rev() {
      if a[(i - 1) * n + k].abs() < a[i * n + k].abs() {
        for j in 0..n {
          a.swap((i - 1) * n + j, i * n + j);
        }
        b.swap(i - 1, i);
      }
    }
    if a[k * n + k].abs() < PIVOT_EPS {
      return false;
    }
    for i in k + 1..n {
      let c = a[i * n + k] / a[k * n + k];
      for j in 0..n {
        a[i * n + j] -= c * a[k * n + j];
      }
      b[i] -= c * b[k];
    }
  }

  for i in (0..n).rev() {
    if a[i * n + i].abs() < PIVOT_EPS {
      return false;
    }
    let c = (i + 1..n).map(|j| a[i * n + j] * x[j]).sum::<f64>();
    x[i] = (b[i] - c) / a[i * n + i];
  }
  true
}

/// `res = m1 * m2` for row-major matrices of shape `(rows, inner)` and
/// `(inner, cols)`.
pub(crate) fn multiply_mat(
  m1: &[f64], m2: &[f64], res: &mut [f64], rows: usize, inner: usize,
  cols: usize,
) {
  assert!(m1.len() >= rows * inner);
  assert!(m2.len() >= inner * cols);
  assert!(res.len() >= rows * cols);
  for r in 0..rows {
    for c in 0..cols {
      let mut sum = 0.0;
      for i in 0..inner {
        sum += m1[r * inner + i] * m2[i * cols + c];
      }
      res[r * cols + c] = sum;
    }
  }
}

/// Cosine similarity of two coefficient vectors, used to decide whether two
/// AR fits describe the same noise process.
pub(crate) fn normalized_cross_correlation(a: &[f64], b: &[f64]) -> f64 {
  debug_assert_eq!(a.len(), b.len());
  let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();
  let a_len = a.iter().map(|x| x * x).sum::<f64>();
  let b_len = b.iter().map(|x| x * x).sum::<f64>();
  // An all-zero vector reads as fully decorrelated rather than NaN.
  dot / (a_len * b_len).sqrt().max(1e-12)
}

#[cfg(test)]
mod test {
  use super::*;
  use rand::Rng;
  use rand::SeedableRng;
  use rand_chacha::ChaChaRng;

  fn add_observation(eqns: &mut EquationSystem, row: &[f64], rhs: f64) {
    let n = eqns.size();
    for i in 0..n {
      for j in 0..n {
        eqns.a[i * n + j] += row[i] * row[j];
      }
      eqns.b[i] += row[i] * rhs;
    }
  }

  #[test]
  fn solves_known_system() {
    let mut eqns = EquationSystem::new(2);
    // 2x + y = 5, x + 3y = 10  =>  x = 1, y = 3
    eqns.a.copy_from_slice(&[2.0, 1.0, 1.0, 3.0]);
    eqns.b.copy_from_slice(&[5.0, 10.0]);
    assert!(eqns.solve());
    assert!((eqns.solution()[0] - 1.0).abs() < 1e-12);
    assert!((eqns.solution()[1] - 3.0).abs() < 1e-12);
    // The accumulated system is untouched by the solve.
    assert_eq!(eqns.a, vec![2.0, 1.0, 1.0, 3.0]);
    assert_eq!(eqns.b, vec![5.0, 10.0]);
  }

  #[test]
  fn rejects_singular_system() {
    let mut eqns = EquationSystem::new(2);
    eqns.a.copy_from_slice(&[1.0, 2.0, 2.0, 4.0]);
    eqns.b.copy_from_slice(&[1.0, 2.0]);
    assert!(!eqns.solve());
  }

  #[test]
  fn merged_systems_match_merged_observations() {
    let mut rng = ChaChaRng::seed_from_u64(0x5eed);
    let n = 4;
    let truth = [0.4, -0.2, 0.1, 0.7];

    let mut first = EquationSystem::new(n);
    let mut second = EquationSystem::new(n);
    let mut joint = EquationSystem::new(n);
    for k in 0..200 {
      let row: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
      let rhs: f64 =
        row.iter().zip(truth.iter()).map(|(r, t)| r * t).sum::<f64>();
      add_observation(if k < 100 { &mut first } else { &mut second }, &row, rhs);
      add_observation(&mut joint, &row, rhs);
    }

    first.add_assign(&second);
    assert!(first.solve());
    assert!(joint.solve());
    for (a, b) in first.solution().iter().zip(joint.solution()) {
      assert!((a - b).abs() < 1e-9);
    }
  }

  #[test]
  fn multiply_mat_matches_reference() {
    let m1 = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
    let m2 = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0]; // 3x2
    let mut res = [0.0; 4];
    multiply_mat(&m1, &m2, &mut res, 2, 3, 2);
    assert_eq!(res, [58.0, 64.0, 139.0, 154.0]);
  }

  #[test]
  fn cross_correlation_bounds() {
    let a = [0.5, -0.25, 0.125];
    assert!((normalized_cross_correlation(&a, &a) - 1.0).abs() < 1e-12);
    let b = [-0.5, 0.25, -0.125];
    assert!((normalized_cross_correlation(&a, &b) + 1.0).abs() < 1e-12);
    let z = [0.0; 3];
    assert_eq!(normalized_cross_correlation(&a, &z), 0.0);
  }
}
