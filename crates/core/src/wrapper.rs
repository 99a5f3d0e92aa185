use anyhow::{bail, Result};

use crate::layer::Layer;
use crate::resize::{resize, InterpolationMode};
use crate::types::{ForwardArgs, Tensor};

/// Resizes the incoming feature map, then runs the wrapped block on it.
///
/// `W(x, args) = U(resize(x, scale, mode), args)`. The matching decoder-side
/// wrapper restores the resolution; one wrapper never does both.
pub struct ScalingWrapper {
    scale: f64,
    mode: InterpolationMode,
    inner: Box<dyn Layer>,
}

impl ScalingWrapper {
    pub fn new(scale: f64, mode: InterpolationMode, inner: Box<dyn Layer>) -> Result<Self> {
        validate_scale(scale)?;
        Ok(Self { scale, mode, inner })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Update the factor in place. Used by smooth scaling between steps.
    pub fn set_scale(&mut self, scale: f64) -> Result<()> {
        validate_scale(scale)?;
        self.scale = scale;
        Ok(())
    }

    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    pub fn inner(&self) -> &dyn Layer {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn Layer> {
        self.inner
    }
}

impl Layer for ScalingWrapper {
    fn layer_type(&self) -> &str {
        "ScalingWrapper"
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn forward(&self, x: Tensor, args: &ForwardArgs) -> Result<Tensor> {
        let x = resize(&x, self.scale, self.mode)?;
        self.inner.forward(x, args)
    }
}

pub(crate) fn validate_scale(scale: f64) -> Result<()> {
    if !scale.is_finite() || scale <= 0.0 {
        bail!("scale factor must be positive and finite, got {scale}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{ChannelAffine, Identity};

    #[test]
    fn test_wrapper_downscales_before_inner_block() {
        let wrapper =
            ScalingWrapper::new(0.5, InterpolationMode::Bicubic, Box::new(Identity::new("b"))).unwrap();
        let y = wrapper
            .forward(Tensor::ones((1, 4, 16, 12)), &ForwardArgs::default())
            .unwrap();
        assert_eq!(y.dim(), (1, 4, 8, 6));
        assert_eq!(wrapper.layer_type(), "ScalingWrapper");
        assert_eq!(wrapper.name(), "b");
    }

    #[test]
    fn test_wrapper_forwards_args_to_inner_block() {
        let inner = ChannelAffine::new("input_blocks.1", vec![1.0], vec![2.0]).unwrap();
        let wrapper = ScalingWrapper::new(2.0, InterpolationMode::Nearest, Box::new(inner)).unwrap();
        let args = ForwardArgs {
            timestep_embedding: vec![0.5],
            context: None,
        };
        let y = wrapper.forward(Tensor::zeros((1, 1, 2, 2)), &args).unwrap();
        assert_eq!(y.dim(), (1, 1, 4, 4));
        assert!(y.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_wrapper_down_then_up_restores_resolution() {
        let down =
            ScalingWrapper::new(0.5, InterpolationMode::Bilinear, Box::new(Identity::new("enc"))).unwrap();
        let up =
            ScalingWrapper::new(2.0, InterpolationMode::Bilinear, Box::new(Identity::new("dec"))).unwrap();
        let args = ForwardArgs::default();
        let x = Tensor::ones((2, 3, 64, 48));
        let y = up.forward(down.forward(x, &args).unwrap(), &args).unwrap();
        assert_eq!(y.dim(), (2, 3, 64, 48));
    }

    #[test]
    fn test_set_scale_updates_in_place_and_validates() {
        let mut wrapper =
            ScalingWrapper::new(0.5, InterpolationMode::Area, Box::new(Identity::new("b"))).unwrap();
        wrapper.set_scale(0.75).unwrap();
        assert_eq!(wrapper.scale(), 0.75);
        assert_eq!(wrapper.mode(), InterpolationMode::Area);

        let err = wrapper.set_scale(0.0).err().expect("should fail");
        assert!(err.to_string().contains("scale factor must be positive"));
        assert_eq!(wrapper.scale(), 0.75);
    }

    #[test]
    fn test_into_inner_returns_original_block() {
        let wrapper =
            ScalingWrapper::new(0.5, InterpolationMode::Bicubic, Box::new(Identity::new("orig"))).unwrap();
        assert_eq!(wrapper.inner().name(), "orig");
        let inner = wrapper.into_inner();
        assert_eq!(inner.layer_type(), "Identity");
        assert_eq!(inner.name(), "orig");
    }
}
