//! Ordered block sequences with in-place wrapper substitution.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::layer::Layer;
use crate::resize::InterpolationMode;
use crate::types::{ForwardArgs, Tensor};
use crate::wrapper::{validate_scale, ScalingWrapper};

/// Entry of a [`LayerCollection`], tagged with whether it is currently wrapped.
pub enum LayerSlot {
    Original(Box<dyn Layer>),
    Scaled(ScalingWrapper),
}

impl LayerSlot {
    pub fn is_scaled(&self) -> bool {
        matches!(self, Self::Scaled(_))
    }

    /// Current factor of the wrapper, `None` for an original block.
    pub fn scale(&self) -> Option<f64> {
        match self {
            Self::Original(_) => None,
            Self::Scaled(wrapper) => Some(wrapper.scale()),
        }
    }

    /// The original block, looking through a wrapper if present.
    pub fn original(&self) -> &dyn Layer {
        match self {
            Self::Original(layer) => layer.as_ref(),
            Self::Scaled(wrapper) => wrapper.inner(),
        }
    }

    pub fn forward(&self, x: Tensor, args: &ForwardArgs) -> Result<Tensor> {
        match self {
            Self::Original(layer) => layer.forward(x, args),
            Self::Scaled(wrapper) => wrapper.forward(x, args),
        }
    }
}

/// Structural snapshot of one slot, used to compare collections before and after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotLayout {
    pub name: String,
    pub layer_type: String,
    pub scale: Option<f64>,
}

/// Ordered sequence of blocks addressed by depth.
///
/// Wrapping and restoring replace entries in place; the length never changes.
pub struct LayerCollection {
    name: String,
    slots: Vec<LayerSlot>,
}

impl LayerCollection {
    pub fn new(name: impl Into<String>, layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            name: name.into(),
            slots: layers.into_iter().map(LayerSlot::Original).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LayerSlot> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerSlot> {
        self.slots.iter()
    }

    pub fn scale_at(&self, index: usize) -> Option<f64> {
        self.slots.get(index).and_then(LayerSlot::scale)
    }

    /// Positions currently holding a wrapper.
    pub fn scaled_positions(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_scaled())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn layout(&self) -> Vec<SlotLayout> {
        self.slots
            .iter()
            .map(|slot| SlotLayout {
                name: slot.original().name().to_string(),
                layer_type: slot.original().layer_type().to_string(),
                scale: slot.scale(),
            })
            .collect()
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            bail!(
                "{} index {index} out of range for {} layers",
                self.name,
                self.slots.len()
            );
        }
        Ok(())
    }

    /// Wrap the block at `index`. Returns `false` if it is already wrapped.
    pub fn wrap(&mut self, index: usize, scale: f64, mode: InterpolationMode) -> Result<bool> {
        self.check_index(index)?;
        validate_scale(scale).with_context(|| format!("failed to wrap {}[{index}]", self.name))?;

        match self.slots.remove(index) {
            LayerSlot::Original(layer) => {
                let wrapper = ScalingWrapper::new(scale, mode, layer)?;
                self.slots.insert(index, LayerSlot::Scaled(wrapper));
                Ok(true)
            }
            scaled => {
                self.slots.insert(index, scaled);
                Ok(false)
            }
        }
    }

    /// Put the original block back at `index`. Returns `false` if it was not wrapped.
    pub fn restore(&mut self, index: usize) -> Result<bool> {
        self.check_index(index)?;

        match self.slots.remove(index) {
            LayerSlot::Scaled(wrapper) => {
                self.slots
                    .insert(index, LayerSlot::Original(wrapper.into_inner()));
                Ok(true)
            }
            original => {
                self.slots.insert(index, original);
                Ok(false)
            }
        }
    }

    /// Change the factor of the wrapper at `index`. Returns `false` if it is not wrapped.
    pub fn set_scale(&mut self, index: usize, scale: f64) -> Result<bool> {
        self.check_index(index)?;
        match &mut self.slots[index] {
            LayerSlot::Scaled(wrapper) => {
                wrapper.set_scale(scale)?;
                Ok(true)
            }
            LayerSlot::Original(_) => Ok(false),
        }
    }
}

/// How the decoder block mirroring an encoder depth is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderIndexing {
    /// Early output: the decoder block at the same forward index.
    Forward,
    /// The structurally symmetric block counted from the end: `len - 1 - depth`.
    FromEnd,
}

impl DecoderIndexing {
    pub fn from_early_out(early_out: bool) -> Self {
        if early_out {
            Self::Forward
        } else {
            Self::FromEnd
        }
    }

    pub fn is_early_out(&self) -> bool {
        matches!(self, Self::Forward)
    }

    /// Decoder slot addressed by encoder `depth` in a decoder of `len` blocks.
    pub fn resolve(&self, depth: usize, len: usize) -> Result<usize> {
        if depth >= len {
            bail!("depth {depth} has no mirrored decoder block among {len} layers");
        }
        Ok(match self {
            Self::Forward => depth,
            Self::FromEnd => len - 1 - depth,
        })
    }

    /// Encoder depth whose mirror is decoder slot `index`; the inverse of [`Self::resolve`].
    pub fn depth_for_slot(&self, index: usize, len: usize) -> Result<usize> {
        // Both mappings are involutions.
        self.resolve(index, len)
    }
}
