// Copyright (c) 2024, The grain-model contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Encoder-side film grain modeling and temporal filtering.
//!
//! This crate estimates the statistical properties of sensor/film noise in
//! a video source and reduces it ahead of encoding:
//!
//! - [`FlatBlockFinder`] locates low-texture blocks whose residual is
//!   dominated by noise.
//! - [`wiener_denoise`] builds a denoised reference image from a noise
//!   power spectral density.
//! - [`NoiseModel`] fits an autoregressive noise model plus per-channel
//!   noise-strength curves from source/denoised pairs, and exports compact
//!   [`GrainParams`] for a film-grain synthesis stage.
//! - [`TemporalFilter`] blends motion-compensated neighboring frames into a
//!   cleaner alt-ref style frame using non-local-mean weights.
//!
//! Pixel buffers are [`v_frame`] planes, generic over 8-bit and high
//! bit-depth storage.

pub mod denoise;
pub mod flat;
pub mod math;
pub mod mc;
pub mod me;
pub mod model;
pub mod strength;
pub mod temporal_filter;
pub mod transform;

pub use crate::denoise::{flat_noise_psd, wiener_denoise, DenoiseError};
pub use crate::flat::FlatBlockFinder;
pub use crate::mc::MotionVector;
pub use crate::model::{
  GrainParams, NoiseModel, NoiseModelError, NoiseModelParams,
  NoiseModelUpdate, NoiseShape,
};
pub use crate::strength::{NoiseStrengthLut, NoiseStrengthSolver};
pub use crate::temporal_filter::{
  estimate_noise, estimate_strength, FrameDiff, TemporalFilter,
  TemporalFilterConfig, TemporalFilterError,
};
