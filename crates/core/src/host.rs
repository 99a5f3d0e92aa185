//! In-process stand-in for the image-generation host: per-step callback
//! registry, run context and sampling loop.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::collection::LayerCollection;
use crate::network::Network;
use crate::resize::{resize, resize_to, InterpolationMode};
use crate::types::{spatial_dims, ForwardArgs, Tensor};

/// Payload of every per-step callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DenoiserParams {
    pub sampling_step: usize,
    pub total_sampling_steps: usize,
}

/// Subscriber invoked once per denoising step, before the network runs.
pub trait DenoiserHook: Send {
    fn on_denoiser_step(&mut self, network: &mut Network, params: &DenoiserParams) -> Result<()>;
}

struct CallbackEntry {
    owner: String,
    hook: Box<dyn DenoiserHook>,
}

/// Owner-keyed registry of denoiser callbacks.
#[derive(Default)]
pub struct DenoiserCallbacks {
    entries: Vec<CallbackEntry>,
}

impl DenoiserCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, owner: &str, hook: Box<dyn DenoiserHook>) {
        self.entries.push(CallbackEntry {
            owner: owner.to_string(),
            hook,
        });
    }

    /// Remove every callback registered by `owner`. Returns how many were removed.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.owner != owner);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn owners(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.owner.as_str()).collect()
    }

    pub fn dispatch(&mut self, network: &mut Network, params: &DenoiserParams) -> Result<()> {
        for entry in &mut self.entries {
            entry
                .hook
                .on_denoiser_step(network, params)
                .with_context(|| {
                    format!(
                        "denoiser callback '{}' failed at step {}/{}",
                        entry.owner, params.sampling_step, params.total_sampling_steps
                    )
                })?;
        }
        Ok(())
    }
}

/// One sampling pass of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PassPlan {
    pub steps: usize,
    /// Factor applied to the latent before this pass starts.
    pub latent_scale: f64,
}

impl PassPlan {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            latent_scale: 1.0,
        }
    }

    pub fn with_latent_scale(mut self, latent_scale: f64) -> Self {
        self.latent_scale = latent_scale;
        self
    }
}

/// Per-run context: lives for exactly one generation run.
pub struct GenerationRun {
    pub callbacks: DenoiserCallbacks,
    /// Set by the host to keep the resolution fix out of this run.
    pub suppress_hires_fix: bool,
    passes: Vec<PassPlan>,
}

impl GenerationRun {
    pub fn new(passes: Vec<PassPlan>) -> Result<Self> {
        if passes.is_empty() {
            bail!("a generation run needs at least one pass");
        }
        if let Some(index) = passes.iter().position(|pass| pass.steps == 0) {
            bail!("pass {index} has no sampling steps");
        }
        Ok(Self {
            callbacks: DenoiserCallbacks::new(),
            suppress_hires_fix: false,
            passes,
        })
    }

    pub fn single_pass(steps: usize) -> Result<Self> {
        Self::new(vec![PassPlan::new(steps)])
    }

    pub fn passes(&self) -> &[PassPlan] {
        &self.passes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaledSlot {
    pub index: usize,
    pub scale: f64,
}

/// Patch state observed at one step, after callbacks ran and before the forward pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub pass: usize,
    pub step: usize,
    pub total_steps: usize,
    pub input_blocks: Vec<ScaledSlot>,
    pub output_blocks: Vec<ScaledSlot>,
    pub latent: (usize, usize),
    pub cost: u64,
}

pub struct SampleOutcome {
    pub latent: Tensor,
    pub steps: Vec<StepRecord>,
    pub total_cost: u64,
}

/// Sequential sampling loop over every pass of a run.
pub struct Sampler;

impl Sampler {
    pub fn sample(
        network: &mut Network,
        run: &mut GenerationRun,
        mut latent: Tensor,
    ) -> Result<SampleOutcome> {
        let mut steps = Vec::new();
        let mut total_cost = 0u64;
        for (pass_index, pass) in run.passes.iter().enumerate() {
            if pass.latent_scale != 1.0 {
                latent = resize(&latent, pass.latent_scale, InterpolationMode::Bilinear)
                    .with_context(|| format!("failed to rescale latent for pass {pass_index}"))?;
            }
            let (h, w) = spatial_dims(&latent);
            info!(pass = pass_index, steps = pass.steps, height = h, width = w, "Starting sampling pass");

            for step in 0..pass.steps {
                let params = DenoiserParams {
                    sampling_step: step,
                    total_sampling_steps: pass.steps,
                };
                run.callbacks.dispatch(network, &params)?;

                let input_blocks = scaled_slots(&network.input_blocks);
                let output_blocks = scaled_slots(&network.output_blocks);

                let args = ForwardArgs::for_step(step, pass.steps);
                let forward = network
                    .forward(latent.clone(), &args)
                    .with_context(|| format!("network forward failed at pass {pass_index} step {step}"))?;

                let mut denoised = forward.output;
                if spatial_dims(&denoised) != (h, w) {
                    debug!(
                        pass = pass_index,
                        step,
                        got = ?spatial_dims(&denoised),
                        expected = ?(h, w),
                        "Network output resolution differs from latent; resampling"
                    );
                    denoised = resize_to(&denoised, h, w, InterpolationMode::Bilinear)?;
                }
                latent = (&latent + &denoised).mapv(|v| v * 0.5);

                debug!(pass = pass_index, step, cost = forward.cost, "Sampling step complete");
                total_cost += forward.cost;
                steps.push(StepRecord {
                    pass: pass_index,
                    step,
                    total_steps: pass.steps,
                    input_blocks,
                    output_blocks,
                    latent: (h, w),
                    cost: forward.cost,
                });
            }
        }

        Ok(SampleOutcome {
            latent,
            steps,
            total_cost,
        })
    }
}

fn scaled_slots(collection: &LayerCollection) -> Vec<ScaledSlot> {
    collection
        .scaled_positions()
        .into_iter()
        .filter_map(|index| {
            collection
                .scale_at(index)
                .map(|scale| ScaledSlot { index, scale })
        })
        .collect()
}
