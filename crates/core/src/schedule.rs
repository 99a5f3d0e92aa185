use serde::{Deserialize, Serialize};

use crate::collection::DecoderIndexing;
use crate::resize::InterpolationMode;

/// Depth at which a resolution reduction applies, and when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalePoint {
    /// Fraction of the total sampling steps after which the reduction is removed.
    pub stop_fraction: f64,
    pub depth: usize,
}

impl ScalePoint {
    pub fn new(stop_fraction: f64, depth: usize) -> Self {
        Self {
            stop_fraction,
            depth,
        }
    }

    /// Step count below which this point is active.
    pub fn threshold(&self, total_steps: usize) -> f64 {
        self.stop_fraction * total_steps as f64
    }
}

/// Which of the two configured points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointRole {
    Inner,
    Outer,
}

impl PointRole {
    /// Evaluation order within a step.
    pub const ORDER: [PointRole; 2] = [PointRole::Inner, PointRole::Outer];

    pub fn index(&self) -> usize {
        match self {
            Self::Inner => 0,
            Self::Outer => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Outer => "outer",
        }
    }
}

/// Resolved per-run patch configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchConfig {
    inner: ScalePoint,
    outer: ScalePoint,
    pub downscale: f64,
    pub upscale: f64,
    pub mode: InterpolationMode,
    pub smooth_scaling: bool,
    pub indexing: DecoderIndexing,
    pub only_one_pass: bool,
}

impl PatchConfig {
    /// Build a config; an outer stop fraction below the inner one is raised to it.
    ///
    /// Only the fraction is corrected, the outer depth is kept.
    pub fn new(inner: ScalePoint, mut outer: ScalePoint) -> Self {
        if inner.stop_fraction > outer.stop_fraction {
            outer.stop_fraction = inner.stop_fraction;
        }
        Self {
            inner,
            outer,
            downscale: 0.5,
            upscale: 2.0,
            mode: InterpolationMode::Bicubic,
            smooth_scaling: false,
            indexing: DecoderIndexing::FromEnd,
            only_one_pass: false,
        }
    }

    pub fn with_factors(mut self, downscale: f64, upscale: f64) -> Self {
        self.downscale = downscale;
        self.upscale = upscale;
        self
    }

    pub fn with_mode(mut self, mode: InterpolationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_smooth_scaling(mut self, smooth_scaling: bool) -> Self {
        self.smooth_scaling = smooth_scaling;
        self
    }

    pub fn with_early_out(mut self, early_out: bool) -> Self {
        self.indexing = DecoderIndexing::from_early_out(early_out);
        self
    }

    pub fn with_only_one_pass(mut self, only_one_pass: bool) -> Self {
        self.only_one_pass = only_one_pass;
        self
    }

    pub fn inner(&self) -> ScalePoint {
        self.inner
    }

    pub fn outer(&self) -> ScalePoint {
        self.outer
    }

    pub fn point(&self, role: PointRole) -> ScalePoint {
        match role {
            PointRole::Inner => self.inner,
            PointRole::Outer => self.outer,
        }
    }

    pub fn shares_depth(&self) -> bool {
        self.inner.depth == self.outer.depth
    }

    pub fn early_out(&self) -> bool {
        self.indexing.is_early_out()
    }
}

/// Factors for step `step` of an active window ending at `threshold`.
///
/// The downscale factor rises linearly from `downscale` toward 1.0 and the
/// upscale factor moves inversely, keeping `down * up` equal to
/// `downscale * upscale`.
pub fn smooth_factors(step: usize, threshold: f64, downscale: f64, upscale: f64) -> (f64, f64) {
    if threshold <= 0.0 {
        return (downscale, upscale);
    }
    let ratio = step as f64 / threshold;
    let down = ((1.0 - downscale) * ratio + downscale).min(1.0);
    let up = upscale * (downscale / down);
    (down, up)
}
