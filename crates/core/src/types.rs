use ndarray::Array4;

/// Feature map in NCHW layout (batch, channels, height, width).
pub type Tensor = Array4<f32>;

/// Conditioning passed alongside the feature map to every block.
///
/// Blocks receive it untouched; only the feature map is resized by a
/// scaling wrapper.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardArgs {
    /// Timestep embedding for the current denoising step.
    pub timestep_embedding: Vec<f32>,
    /// Optional per-channel conditioning bias.
    pub context: Option<Vec<f32>>,
}

impl ForwardArgs {
    pub fn for_step(step: usize, total_steps: usize) -> Self {
        let t = if total_steps == 0 {
            0.0
        } else {
            1.0 - step as f32 / total_steps as f32
        };
        Self {
            timestep_embedding: vec![t],
            context: None,
        }
    }

    pub fn timestep(&self) -> f32 {
        self.timestep_embedding.first().copied().unwrap_or(0.0)
    }
}

/// Spatial size of an NCHW tensor as `(height, width)`.
pub fn spatial_dims(tensor: &Tensor) -> (usize, usize) {
    let (_, _, h, w) = tensor.dim();
    (h, w)
}
