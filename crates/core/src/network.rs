//! Symmetric encoder/decoder feature network driven by the sampler.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::collection::{LayerCollection, SlotLayout};
use crate::layer::{ChannelAffine, Identity, Layer};
use crate::types::{spatial_dims, ForwardArgs, Tensor};

pub const INPUT_BLOCKS: &str = "input_blocks";
pub const OUTPUT_BLOCKS: &str = "output_blocks";

/// Result of one forward pass.
pub struct ForwardOutput {
    pub output: Tensor,
    /// Sum of `channels * height * width` over every block output; a proxy for compute.
    pub cost: u64,
}

/// Structural snapshot of both paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLayout {
    pub input_blocks: Vec<SlotLayout>,
    pub output_blocks: Vec<SlotLayout>,
}

impl NetworkLayout {
    pub fn is_unpatched(&self) -> bool {
        self.input_blocks
            .iter()
            .chain(self.output_blocks.iter())
            .all(|slot| slot.scale.is_none())
    }
}

pub struct Network {
    pub input_blocks: LayerCollection,
    pub middle_block: Box<dyn Layer>,
    pub output_blocks: LayerCollection,
}

impl Network {
    pub fn new(
        input_blocks: LayerCollection,
        middle_block: Box<dyn Layer>,
        output_blocks: LayerCollection,
    ) -> Self {
        Self {
            input_blocks,
            middle_block,
            output_blocks,
        }
    }

    /// Build a network with `blocks` encoder and `blocks` decoder blocks over `channels` channels.
    pub fn symmetric(blocks: usize, channels: usize) -> Result<Self> {
        if blocks == 0 {
            bail!("network needs at least one block per path");
        }
        if channels == 0 {
            bail!("network needs at least one channel");
        }

        let input_blocks = (0..blocks)
            .map(|i| affine_block(INPUT_BLOCKS, i, blocks, channels))
            .collect::<Result<Vec<_>>>()?;
        let output_blocks = (0..blocks)
            .map(|i| affine_block(OUTPUT_BLOCKS, i, blocks, channels))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(
            LayerCollection::new(INPUT_BLOCKS, input_blocks),
            Box::new(Identity::new("middle_block")),
            LayerCollection::new(OUTPUT_BLOCKS, output_blocks),
        ))
    }

    pub fn layout(&self) -> NetworkLayout {
        NetworkLayout {
            input_blocks: self.input_blocks.layout(),
            output_blocks: self.output_blocks.layout(),
        }
    }

    pub fn forward(&self, x: Tensor, args: &ForwardArgs) -> Result<ForwardOutput> {
        let mut cost = 0u64;
        let mut h = x;

        for (index, slot) in self.input_blocks.iter().enumerate() {
            h = slot
                .forward(h, args)
                .with_context(|| format!("{INPUT_BLOCKS}[{index}] forward failed"))?;
            cost += element_count(&h);
        }

        h = self
            .middle_block
            .forward(h, args)
            .context("middle_block forward failed")?;
        cost += element_count(&h);

        for (index, slot) in self.output_blocks.iter().enumerate() {
            h = slot
                .forward(h, args)
                .with_context(|| format!("{OUTPUT_BLOCKS}[{index}] forward failed"))?;
            cost += element_count(&h);
        }

        Ok(ForwardOutput { output: h, cost })
    }
}

fn affine_block(path: &str, index: usize, blocks: usize, channels: usize) -> Result<Box<dyn Layer>> {
    let depth_weight = (index + 1) as f32 / blocks as f32;
    let gain = (0..channels)
        .map(|c| 1.0 - 0.01 * depth_weight * (c + 1) as f32)
        .collect();
    let bias = (0..channels)
        .map(|c| 0.001 * depth_weight * c as f32)
        .collect();
    Ok(Box::new(ChannelAffine::new(
        format!("{path}.{index}"),
        gain,
        bias,
    )?))
}

fn element_count(tensor: &Tensor) -> u64 {
    let (_, channels, _, _) = tensor.dim();
    let (h, w) = spatial_dims(tensor);
    (channels * h * w) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resize::InterpolationMode;

    #[test]
    fn test_symmetric_network_shape() {
        let network = Network::symmetric(12, 4).unwrap();
        assert_eq!(network.input_blocks.len(), 12);
        assert_eq!(network.output_blocks.len(), 12);
        assert_eq!(network.input_blocks.name(), INPUT_BLOCKS);
        let layout = network.layout();
        assert!(layout.is_unpatched());
        assert_eq!(layout.input_blocks[3].name, "input_blocks.3");
        assert_eq!(layout.output_blocks[11].name, "output_blocks.11");
    }

    #[test]
    fn test_symmetric_network_rejects_empty_config() {
        assert!(Network::symmetric(0, 4).is_err());
        assert!(Network::symmetric(4, 0).is_err());
    }

    #[test]
    fn test_forward_preserves_shape_and_counts_cost() {
        let network = Network::symmetric(4, 2).unwrap();
        let out = network
            .forward(Tensor::ones((1, 2, 8, 8)), &ForwardArgs::for_step(0, 10))
            .unwrap();
        assert_eq!(out.output.dim(), (1, 2, 8, 8));
        assert_eq!(out.cost, 9 * 2 * 64);
    }

    #[test]
    fn test_patched_forward_is_cheaper_and_restores_resolution() {
        let mut network = Network::symmetric(4, 2).unwrap();
        let args = ForwardArgs::for_step(0, 10);
        let baseline = network.forward(Tensor::ones((1, 2, 16, 16)), &args).unwrap();

        network
            .input_blocks
            .wrap(1, 0.5, InterpolationMode::Bicubic)
            .unwrap();
        network
            .output_blocks
            .wrap(2, 2.0, InterpolationMode::Bicubic)
            .unwrap();
        let patched = network.forward(Tensor::ones((1, 2, 16, 16)), &args).unwrap();

        assert_eq!(patched.output.dim(), (1, 2, 16, 16));
        assert!(patched.cost < baseline.cost);
        assert!(!network.layout().is_unpatched());
    }

    #[test]
    fn test_forward_error_names_failing_block() {
        let network = Network::symmetric(2, 3).unwrap();
        let err = network
            .forward(Tensor::ones((1, 4, 4, 4)), &ForwardArgs::default())
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("input_blocks[0] forward failed"));
    }
}
