//! Pure-Rust NCHW feature map resizing with fractional scale factors.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::Tensor;

/// Cubic convolution coefficient used by bicubic interpolation.
const CUBIC_A: f64 = -0.75;

/// Largest output height or width `resize_to` will allocate.
pub const MAX_SPATIAL_SIZE: usize = 16384;

/// Supported interpolation algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterpolationMode {
    #[default]
    Bicubic,
    Bilinear,
    Nearest,
    NearestExact,
    Area,
}

impl InterpolationMode {
    pub const ALL: [InterpolationMode; 5] = [
        Self::Bicubic,
        Self::Bilinear,
        Self::Nearest,
        Self::NearestExact,
        Self::Area,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bicubic => "bicubic",
            Self::Bilinear => "bilinear",
            Self::Nearest => "nearest",
            Self::NearestExact => "nearest-exact",
            Self::Area => "area",
        }
    }
}

impl fmt::Display for InterpolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterpolationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bicubic" | "cubic" => Ok(Self::Bicubic),
            "bilinear" | "linear" => Ok(Self::Bilinear),
            "nearest" | "nn" => Ok(Self::Nearest),
            "nearest-exact" | "nearest_exact" => Ok(Self::NearestExact),
            "area" => Ok(Self::Area),
            other => bail!(
                "unknown interpolation mode '{other}' (expected one of: bicubic, bilinear, nearest, nearest-exact, area)"
            ),
        }
    }
}

/// One source sample contributing to a destination coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tap {
    index: usize,
    weight: f32,
}

/// Spatial size after scaling: `floor(size * scale)`, never below 1.
pub fn scaled_size(size: usize, scale: f64) -> usize {
    ((size as f64 * scale).floor() as usize).max(1)
}

/// Resize the spatial dimensions of `input` by `scale`.
///
/// Batch and channel counts are preserved. A factor of exactly 1.0
/// returns a copy of the input.
pub fn resize(input: &Tensor, scale: f64, mode: InterpolationMode) -> Result<Tensor> {
    if !scale.is_finite() || scale <= 0.0 {
        bail!("scale factor must be positive and finite, got {scale}");
    }
    if scale == 1.0 {
        return Ok(input.clone());
    }

    let (_, _, in_h, in_w) = input.dim();
    resize_to(input, scaled_size(in_h, scale), scaled_size(in_w, scale), mode)
}

/// Resize the spatial dimensions of `input` to exactly `out_h` x `out_w`.
pub fn resize_to(
    input: &Tensor,
    out_h: usize,
    out_w: usize,
    mode: InterpolationMode,
) -> Result<Tensor> {
    let (batch, channels, in_h, in_w) = input.dim();
    if in_h == 0 || in_w == 0 {
        bail!("cannot resize an empty {in_h}x{in_w} feature map");
    }
    if out_h == 0 || out_w == 0 {
        bail!("target dimensions must be positive, got {out_h}x{out_w}");
    }
    if out_h > MAX_SPATIAL_SIZE || out_w > MAX_SPATIAL_SIZE {
        bail!(
            "target dimensions {out_h}x{out_w} exceed the {MAX_SPATIAL_SIZE} limit per axis"
        );
    }

    let rows = axis_taps(in_h, out_h, mode);
    let cols = axis_taps(in_w, out_w, mode);

    let mut output = Tensor::zeros((batch, channels, out_h, out_w));
    for (src, mut dst) in input.outer_iter().zip(output.outer_iter_mut()) {
        for (src_plane, mut dst_plane) in src.outer_iter().zip(dst.outer_iter_mut()) {
            for (y, row_taps) in rows.iter().enumerate() {
                for (x, col_taps) in cols.iter().enumerate() {
                    let mut acc = 0.0f32;
                    for ty in row_taps {
                        for tx in col_taps {
                            acc += ty.weight * tx.weight * src_plane[[ty.index, tx.index]];
                        }
                    }
                    dst_plane[[y, x]] = acc;
                }
            }
        }
    }

    Ok(output)
}

/// Per-destination sampling taps along one axis.
fn axis_taps(in_size: usize, out_size: usize, mode: InterpolationMode) -> Vec<Vec<Tap>> {
    let ratio = in_size as f64 / out_size as f64;
    let last = in_size - 1;

    (0..out_size)
        .map(|dst| match mode {
            InterpolationMode::Nearest => {
                let src = ((dst as f64 * ratio).floor() as usize).min(last);
                vec![Tap {
                    index: src,
                    weight: 1.0,
                }]
            }
            InterpolationMode::NearestExact => {
                let src = (((dst as f64 + 0.5) * ratio).floor() as usize).min(last);
                vec![Tap {
                    index: src,
                    weight: 1.0,
                }]
            }
            InterpolationMode::Bilinear => {
                let src = ((dst as f64 + 0.5) * ratio - 0.5).max(0.0);
                let i0 = (src.floor() as usize).min(last);
                let i1 = (i0 + 1).min(last);
                let frac = (src - i0 as f64).clamp(0.0, 1.0);
                vec![
                    Tap {
                        index: i0,
                        weight: (1.0 - frac) as f32,
                    },
                    Tap {
                        index: i1,
                        weight: frac as f32,
                    },
                ]
            }
            InterpolationMode::Bicubic => {
                let src = (dst as f64 + 0.5) * ratio - 0.5;
                let base = src.floor();
                let weights = cubic_weights(src - base);
                let base = base as isize;
                weights
                    .iter()
                    .enumerate()
                    .map(|(k, w)| Tap {
                        index: (base - 1 + k as isize).clamp(0, last as isize) as usize,
                        weight: *w as f32,
                    })
                    .collect()
            }
            InterpolationMode::Area => {
                let start = dst * in_size / out_size;
                let end = ((dst + 1) * in_size).div_ceil(out_size).max(start + 1);
                let weight = 1.0 / (end - start) as f32;
                (start..end.min(in_size))
                    .map(|index| Tap { index, weight })
                    .collect()
            }
        })
        .collect()
}

/// Keys cubic convolution weights for the four taps around `t ∈ [0, 1)`.
fn cubic_weights(t: f64) -> [f64; 4] {
    let a = CUBIC_A;
    let w0 = ((a * (t + 1.0) - 5.0 * a) * (t + 1.0) + 8.0 * a) * (t + 1.0) - 4.0 * a;
    let w1 = ((a + 2.0) * t - (a + 3.0)) * t * t + 1.0;
    let u = 1.0 - t;
    let w2 = ((a + 2.0) * u - (a + 3.0)) * u * u + 1.0;
    let w3 = 1.0 - w0 - w1 - w2;
    [w0, w1, w2, w3]
}
