//! Extension entry points: per-run registration and the post-run teardown.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::collection::DecoderIndexing;
use crate::config::HiresFixSettings;
use crate::controller::{restore_network, PatchController, RestoreReport};
use crate::host::{GenerationRun, SampleOutcome, Sampler};
use crate::network::Network;
use crate::types::Tensor;

pub const SCRIPT_TITLE: &str = "Kohya Hires.fix";
/// Owner key of the denoiser callback in the host registry.
pub const CALLBACK_OWNER: &str = "kohya_hires_fix";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// The script itself was switched off.
    Disabled,
    /// The host flagged this run to run without the fix.
    Suppressed,
    /// `enable = false` in the run settings.
    NotEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum ProcessOutcome {
    Registered,
    Skipped(SkipReason),
}

pub struct GenerationReport {
    pub process: ProcessOutcome,
    pub sample: SampleOutcome,
    pub restore: RestoreReport,
}

#[derive(Debug, Default)]
pub struct HiresFixScript {
    disable: bool,
}

impl HiresFixScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&self) -> &'static str {
        SCRIPT_TITLE
    }

    pub fn is_enabled(&self) -> bool {
        !self.disable
    }

    pub fn set_disabled(&mut self, disable: bool) {
        self.disable = disable;
    }

    /// Register a fresh [`PatchController`] for this run, or deregister when the fix is off.
    pub fn process(
        &self,
        run: &mut GenerationRun,
        settings: &HiresFixSettings,
    ) -> Result<ProcessOutcome> {
        let skip = if self.disable {
            Some(SkipReason::Disabled)
        } else if run.suppress_hires_fix {
            Some(SkipReason::Suppressed)
        } else if !settings.enable {
            Some(SkipReason::NotEnabled)
        } else {
            None
        };

        let removed = run.callbacks.remove_owner(CALLBACK_OWNER);
        if let Some(reason) = skip {
            info!(?reason, removed, "{SCRIPT_TITLE} inactive for this run; callback deregistered");
            return Ok(ProcessOutcome::Skipped(reason));
        }

        let config = settings.resolve()?;
        info!(
            inner_depth = config.inner().depth,
            outer_depth = config.outer().depth,
            downscale = config.downscale,
            upscale = config.upscale,
            mode = %config.mode,
            only_one_pass = config.only_one_pass,
            "{SCRIPT_TITLE} registered"
        );
        run.callbacks
            .register(CALLBACK_OWNER, Box::new(PatchController::new(config)));
        Ok(ProcessOutcome::Registered)
    }

    /// Drop this run's callback and revert any wrapper still in the network.
    pub fn postprocess(
        &self,
        run: &mut GenerationRun,
        network: &mut Network,
        indexing: DecoderIndexing,
    ) -> Result<RestoreReport> {
        run.callbacks.remove_owner(CALLBACK_OWNER);
        restore_network(network, indexing).context("failed to restore network after run")
    }

    /// `process`, sample, then `postprocess`; teardown runs even if sampling fails.
    pub fn run_generation(
        &self,
        settings: &HiresFixSettings,
        network: &mut Network,
        run: &mut GenerationRun,
        latent: Tensor,
    ) -> Result<GenerationReport> {
        let process = self.process(run, settings)?;
        let sampled = Sampler::sample(network, run, latent);
        let restored = self.postprocess(run, network, settings.indexing());
        let (sample, restore) = settle_run(sampled, restored)?;
        Ok(GenerationReport {
            process,
            sample,
            restore,
        })
    }
}

/// Combine sampling and teardown results; a sampling error wins but keeps the teardown error.
fn settle_run(
    sampled: Result<SampleOutcome>,
    restored: Result<RestoreReport>,
) -> Result<(SampleOutcome, RestoreReport)> {
    match (sampled, restored) {
        (Ok(sample), Ok(restore)) => Ok((sample, restore)),
        (Ok(_), Err(restore_error)) => Err(restore_error),
        (Err(error), Ok(restore)) => {
            warn!(
                restored = restore.total(),
                "Sampling failed; network restored before reporting"
            );
            Err(error.context("generation run failed"))
        }
        (Err(error), Err(restore_error)) => Err(error.context(format!(
            "generation run failed and teardown failed too: {restore_error:#}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DenoiserHook, DenoiserParams, PassPlan};
    use anyhow::{anyhow, bail};

    struct FailAt(usize);

    impl DenoiserHook for FailAt {
        fn on_denoiser_step(&mut self, _network: &mut Network, params: &DenoiserParams) -> Result<()> {
            if params.sampling_step == self.0 {
                bail!("host aborted");
            }
            Ok(())
        }
    }

    fn empty_outcome() -> SampleOutcome {
        SampleOutcome {
            latent: Tensor::zeros((1, 1, 1, 1)),
            steps: Vec::new(),
            total_cost: 0,
        }
    }

    #[test]
    fn test_settle_run_keeps_both_errors() {
        let err = settle_run(Err(anyhow!("sampler exploded")), Err(anyhow!("restore exploded")))
            .err()
            .expect("should fail");
        let message = format!("{err:#}");
        assert!(message.contains("sampler exploded"));
        assert!(message.contains("teardown failed too: restore exploded"));
    }

    #[test]
    fn test_settle_run_reports_single_failures() {
        let err = settle_run(Ok(empty_outcome()), Err(anyhow!("restore exploded")))
            .err()
            .expect("should fail");
        assert_eq!(err.to_string(), "restore exploded");

        let err = settle_run(Err(anyhow!("sampler exploded")), Ok(RestoreReport::default()))
            .err()
            .expect("should fail");
        assert_eq!(err.to_string(), "generation run failed");

        let (sample, restore) = settle_run(Ok(empty_outcome()), Ok(RestoreReport::default())).unwrap();
        assert!(sample.steps.is_empty());
        assert_eq!(restore.total(), 0);
    }

    #[test]
    fn test_title_and_enable_state() {
        let mut script = HiresFixScript::new();
        assert_eq!(script.title(), "Kohya Hires.fix");
        assert!(script.is_enabled());
        script.set_disabled(true);
        assert!(!script.is_enabled());
    }

    #[test]
    fn test_process_registers_one_callback() {
        let script = HiresFixScript::new();
        let mut run = GenerationRun::single_pass(10).unwrap();
        let settings = HiresFixSettings::default();

        assert_eq!(script.process(&mut run, &settings).unwrap(), ProcessOutcome::Registered);
        assert_eq!(script.process(&mut run, &settings).unwrap(), ProcessOutcome::Registered);
        assert_eq!(run.callbacks.owners(), vec![CALLBACK_OWNER]);
    }

    #[test]
    fn test_process_deregisters_when_inactive() {
        let mut script = HiresFixScript::new();
        let mut run = GenerationRun::single_pass(10).unwrap();
        let settings = HiresFixSettings::default();
        script.process(&mut run, &settings).unwrap();

        let off = HiresFixSettings {
            enable: false,
            ..Default::default()
        };
        assert_eq!(
            script.process(&mut run, &off).unwrap(),
            ProcessOutcome::Skipped(SkipReason::NotEnabled)
        );
        assert!(run.callbacks.is_empty());

        run.suppress_hires_fix = true;
        assert_eq!(
            script.process(&mut run, &settings).unwrap(),
            ProcessOutcome::Skipped(SkipReason::Suppressed)
        );

        script.set_disabled(true);
        assert_eq!(
            script.process(&mut run, &settings).unwrap(),
            ProcessOutcome::Skipped(SkipReason::Disabled)
        );
        assert!(run.callbacks.is_empty());
    }

    #[test]
    fn test_process_rejects_invalid_settings_without_registering() {
        let script = HiresFixScript::new();
        let mut run = GenerationRun::single_pass(10).unwrap();
        let settings = HiresFixSettings {
            upscale: -2.0,
            ..Default::default()
        };
        assert!(script.process(&mut run, &settings).is_err());
        assert!(run.callbacks.is_empty());
    }

    #[test]
    fn test_run_generation_leaves_network_unpatched() {
        let script = HiresFixScript::new();
        let mut network = Network::symmetric(12, 4).unwrap();
        let before = network.layout();
        let mut run = GenerationRun::single_pass(20).unwrap();
        let settings = HiresFixSettings::default();

        let report = script
            .run_generation(&settings, &mut network, &mut run, Tensor::ones((1, 4, 16, 16)))
            .unwrap();
        assert_eq!(report.process, ProcessOutcome::Registered);
        assert_eq!(report.sample.steps.len(), 20);
        assert_eq!(report.sample.steps[0].input_blocks[0].index, 3);
        assert_eq!(network.layout(), before);
        assert!(run.callbacks.is_empty());
    }

    #[test]
    fn test_run_generation_restores_after_sampling_failure() {
        let script = HiresFixScript::new();
        let mut network = Network::symmetric(12, 4).unwrap();
        let before = network.layout();
        let mut run = GenerationRun::new(vec![PassPlan::new(20)]).unwrap();
        let settings = HiresFixSettings {
            smooth_scaling: false,
            ..Default::default()
        };
        script.process(&mut run, &settings).unwrap();
        run.callbacks.register("host", Box::new(FailAt(1)));

        // run_generation re-registers its own hook; the host hook stays.
        let err = script
            .run_generation(&settings, &mut network, &mut run, Tensor::ones((1, 4, 16, 16)))
            .err()
            .expect("should fail");
        assert!(format!("{err:#}").contains("host aborted"));
        assert_eq!(network.layout(), before);
        assert_eq!(run.callbacks.owners(), vec!["host"]);
    }
}
