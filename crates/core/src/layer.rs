use anyhow::{bail, Result};

use crate::types::{ForwardArgs, Tensor};

/// Core trait that every network block implements.
pub trait Layer: Send {
    fn layer_type(&self) -> &str;

    /// Stable identifier of the block inside its network, e.g. `input_blocks.3`.
    fn name(&self) -> &str;

    fn forward(&self, x: Tensor, args: &ForwardArgs) -> Result<Tensor>;
}

/// Passes the feature map through untouched.
pub struct Identity {
    name: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Layer for Identity {
    fn layer_type(&self) -> &str {
        "Identity"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, x: Tensor, _args: &ForwardArgs) -> Result<Tensor> {
        Ok(x)
    }
}

/// Per-channel affine block: `x * gain[c] + bias[c] * t (+ context[c])`.
///
/// Resolution independent, so it runs unchanged on down-scaled feature maps.
pub struct ChannelAffine {
    name: String,
    gain: Vec<f32>,
    bias: Vec<f32>,
}

impl ChannelAffine {
    pub fn new(name: impl Into<String>, gain: Vec<f32>, bias: Vec<f32>) -> Result<Self> {
        if gain.len() != bias.len() {
            bail!(
                "gain and bias must have the same channel count, got {} and {}",
                gain.len(),
                bias.len()
            );
        }
        Ok(Self {
            name: name.into(),
            gain,
            bias,
        })
    }

    pub fn channels(&self) -> usize {
        self.gain.len()
    }
}

impl Layer for ChannelAffine {
    fn layer_type(&self) -> &str {
        "ChannelAffine"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, mut x: Tensor, args: &ForwardArgs) -> Result<Tensor> {
        let (_, channels, _, _) = x.dim();
        if channels != self.channels() {
            bail!(
                "{} expects {} channels, got {channels}",
                self.name,
                self.channels()
            );
        }

        let t = args.timestep();
        for mut sample in x.outer_iter_mut() {
            for (c, mut plane) in sample.outer_iter_mut().enumerate() {
                let context = args
                    .context
                    .as_ref()
                    .and_then(|ctx| ctx.get(c).copied())
                    .unwrap_or(0.0);
                let gain = self.gain[c];
                let offset = self.bias[c] * t + context;
                plane.mapv_inplace(|v| v * gain + offset);
            }
        }

        Ok(x)
    }
}
