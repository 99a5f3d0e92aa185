//! Step-gated resolution fix for encoder/decoder diffusion networks.
//!
//! Early sampling steps run intermediate feature maps at reduced resolution:
//! a [`wrapper::ScalingWrapper`] downscales in front of an encoder block and a
//! mirrored one upscales in front of the matching decoder block.
//! [`controller::PatchController`] installs and removes them per step.

pub mod collection;
pub mod config;
pub mod controller;
pub mod host;
pub mod layer;
pub mod logging;
pub mod network;
pub mod resize;
pub mod schedule;
pub mod script;
pub mod types;
pub mod wrapper;
