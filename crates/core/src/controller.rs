//! Step-gated installation and removal of scaling wrappers.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::collection::DecoderIndexing;
use crate::host::{DenoiserHook, DenoiserParams};
use crate::network::Network;
use crate::schedule::{smooth_factors, PatchConfig, PointRole};
use crate::wrapper::validate_scale;

/// Installation status of one scale point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    Absent,
    /// Wrappers sit at these slots of the encoder and decoder paths.
    Installed { encoder: usize, decoder: usize },
}

impl PointState {
    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }
}

/// Per-run patch state driven by the denoiser callback.
pub struct PatchController {
    config: PatchConfig,
    states: [PointState; 2],
    step_limit: usize,
}

impl PatchController {
    pub fn new(config: PatchConfig) -> Self {
        Self {
            config,
            states: [PointState::Absent; 2],
            step_limit: 0,
        }
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    pub fn state(&self, role: PointRole) -> PointState {
        self.states[role.index()]
    }

    /// Step index below which callbacks are ignored; 0 means no gate.
    pub fn step_limit(&self) -> usize {
        self.step_limit
    }

    pub fn on_step(&mut self, network: &mut Network, params: &DenoiserParams) -> Result<()> {
        let step = params.sampling_step;
        if self.step_limit != 0 && step < self.step_limit {
            trace!(step, step_limit = self.step_limit, "Step gated, skipping");
            return Ok(());
        }

        for role in PointRole::ORDER {
            let threshold = self.config.point(role).threshold(params.total_sampling_steps);

            let state = self.states[role.index()];
            if (step as f64) < threshold {
                match state {
                    PointState::Absent => self.install(network, role, step)?,
                    PointState::Installed { encoder, decoder } if self.config.smooth_scaling => {
                        self.rescale(network, role, encoder, decoder, step, threshold)?
                    }
                    PointState::Installed { .. } => {}
                }
                break;
            }

            if state.is_installed() {
                if !self.config.shares_depth() || role == PointRole::Outer {
                    self.remove(network, role, step)?;
                } else {
                    self.hand_over(step);
                }
            }
        }

        self.step_limit = if self.config.only_one_pass { step } else { 0 };
        Ok(())
    }

    fn install(&mut self, network: &mut Network, role: PointRole, step: usize) -> Result<()> {
        let depth = self.config.point(role).depth;
        network.input_blocks.check_index(depth)?;
        let decoder = self
            .config
            .indexing
            .resolve(depth, network.output_blocks.len())
            .with_context(|| format!("cannot mirror {} scale point", role.as_str()))?;
        validate_scale(self.config.downscale).context("invalid downscale factor")?;
        validate_scale(self.config.upscale).context("invalid upscale factor")?;

        let fresh_encoder = network
            .input_blocks
            .wrap(depth, self.config.downscale, self.config.mode)?;
        let fresh_decoder = network
            .output_blocks
            .wrap(decoder, self.config.upscale, self.config.mode)?;
        // A wrapper left by the previous pass keeps its last factor; start over.
        if !fresh_encoder {
            network.input_blocks.set_scale(depth, self.config.downscale)?;
        }
        if !fresh_decoder {
            network.output_blocks.set_scale(decoder, self.config.upscale)?;
        }
        self.states[role.index()] = PointState::Installed {
            encoder: depth,
            decoder,
        };

        debug!(
            point = role.as_str(),
            step,
            encoder = depth,
            decoder,
            downscale = self.config.downscale,
            upscale = self.config.upscale,
            mode = %self.config.mode,
            "Installed scaling wrappers"
        );
        Ok(())
    }

    fn rescale(
        &mut self,
        network: &mut Network,
        role: PointRole,
        encoder: usize,
        decoder: usize,
        step: usize,
        threshold: f64,
    ) -> Result<()> {
        let (down, up) = smooth_factors(step, threshold, self.config.downscale, self.config.upscale);
        network.input_blocks.set_scale(encoder, down)?;
        network.output_blocks.set_scale(decoder, up)?;
        trace!(point = role.as_str(), step, downscale = down, upscale = up, "Smooth scale update");
        Ok(())
    }

    fn remove(&mut self, network: &mut Network, role: PointRole, step: usize) -> Result<()> {
        let state = self.states[role.index()];
        if let PointState::Installed { encoder, decoder } = state {
            network.input_blocks.restore(encoder)?;
            network.output_blocks.restore(decoder)?;
            self.states[role.index()] = PointState::Absent;
            debug!(point = role.as_str(), step, encoder, decoder, "Removed scaling wrappers");
        }
        Ok(())
    }

    /// Inner and outer share a depth: the outer point takes over the live wrappers.
    fn hand_over(&mut self, step: usize) {
        let inner = PointRole::Inner.index();
        let outer = PointRole::Outer.index();
        self.states[outer] = self.states[inner];
        self.states[inner] = PointState::Absent;
        debug!(step, "Inner scale point handed its wrappers to the outer point");
    }
}

impl DenoiserHook for PatchController {
    fn on_denoiser_step(&mut self, network: &mut Network, params: &DenoiserParams) -> Result<()> {
        self.on_step(network, params)
    }
}

/// Counts of wrappers reverted by [`restore_network`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub input_blocks: usize,
    pub output_blocks: usize,
}

impl RestoreReport {
    pub fn total(&self) -> usize {
        self.input_blocks + self.output_blocks
    }
}

/// Revert every wrapper left in either path to its original block.
///
/// Decoder entries are addressed through `indexing`, the convention used when
/// they were installed.
pub fn restore_network(network: &mut Network, indexing: DecoderIndexing) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();

    for index in network.input_blocks.scaled_positions() {
        if network.input_blocks.restore(index)? {
            report.input_blocks += 1;
        }
    }

    let len = network.output_blocks.len();
    for position in network.output_blocks.scaled_positions() {
        let depth = indexing.depth_for_slot(position, len)?;
        let index = indexing.resolve(depth, len)?;
        if network.output_blocks.restore(index)? {
            report.output_blocks += 1;
        }
    }

    if report.total() > 0 {
        info!(
            input_blocks = report.input_blocks,
            output_blocks = report.output_blocks,
            "Restored original network blocks"
        );
    }
    Ok(report)
}
