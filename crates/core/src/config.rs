use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::collection::DecoderIndexing;
use crate::logging::DEFAULT_LOG_RETENTION_FILES;
use crate::resize::InterpolationMode;
use crate::schedule::{PatchConfig, ScalePoint};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "HIRESFIX_DATA_DIR";
/// Accepted range of `downscale`.
pub const DOWNSCALE_RANGE: (f64, f64) = (0.1, 1.0);
/// Accepted range of `upscale`.
pub const UPSCALE_RANGE: (f64, f64) = (1.0, 4.0);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub hires_fix: HiresFixSettings,
    pub logging: LoggingConfig,
}

/// User-facing settings of the resolution fix, as stored in `[hires_fix]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HiresFixSettings {
    pub enable: bool,
    /// Keep the fix out of every pass after the first.
    pub only_one_pass: bool,
    pub inner: ScalePoint,
    pub outer: ScalePoint,
    pub downscale: f64,
    pub upscale: f64,
    pub interpolation: InterpolationMode,
    pub smooth_scaling: bool,
    pub early_out: bool,
}

impl Default for HiresFixSettings {
    fn default() -> Self {
        Self {
            enable: true,
            only_one_pass: true,
            inner: ScalePoint::new(0.15, 3),
            outer: ScalePoint::new(0.3, 4),
            downscale: 0.5,
            upscale: 2.0,
            interpolation: InterpolationMode::Bicubic,
            smooth_scaling: true,
            early_out: false,
        }
    }
}

impl HiresFixSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value, (min, max)) in [
            ("downscale", self.downscale, DOWNSCALE_RANGE),
            ("upscale", self.upscale, UPSCALE_RANGE),
        ] {
            if !value.is_finite() || value <= 0.0 {
                bail!("{name} must be a positive finite factor, got {value}");
            }
            if !(min..=max).contains(&value) {
                bail!("{name} must be within [{min}, {max}], got {value}");
            }
        }
        for (name, point) in [("inner", self.inner), ("outer", self.outer)] {
            if !(0.0..=1.0).contains(&point.stop_fraction) {
                bail!(
                    "{name} stop_fraction must be within [0, 1], got {}",
                    point.stop_fraction
                );
            }
        }
        Ok(())
    }

    pub fn indexing(&self) -> DecoderIndexing {
        DecoderIndexing::from_early_out(self.early_out)
    }

    /// Validate and turn the settings into a per-run config.
    pub fn resolve(&self) -> Result<PatchConfig> {
        self.validate().context("invalid hires_fix settings")?;
        Ok(PatchConfig::new(self.inner, self.outer)
            .with_factors(self.downscale, self.upscale)
            .with_mode(self.interpolation)
            .with_smooth_scaling(self.smooth_scaling)
            .with_early_out(self.early_out)
            .with_only_one_pass(self.only_one_pass))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))
    }
}

/// CLI override first, then `HIRESFIX_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }
    env::var_os(ENV_DATA_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default `config.toml`; an existing file is left alone.
///
/// Returns whether a new config file was written.
pub fn initialize_data_dir(data_dir: &Path) -> Result<bool> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if cfg_path.exists() {
        return Ok(false);
    }
    AppConfig::default().save_to_path(&cfg_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_settings_match_documented_values() {
        let settings = HiresFixSettings::default();
        assert!(settings.enable);
        assert!(settings.only_one_pass);
        assert_eq!(settings.inner, ScalePoint::new(0.15, 3));
        assert_eq!(settings.outer, ScalePoint::new(0.3, 4));
        assert_eq!(settings.downscale, 0.5);
        assert_eq!(settings.upscale, 2.0);
        assert_eq!(settings.interpolation, InterpolationMode::Bicubic);
        assert!(settings.smooth_scaling);
        assert!(!settings.early_out);
        assert_eq!(AppConfig::default().logging.retention_files, 14);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.hires_fix.interpolation = InterpolationMode::NearestExact;
        original.hires_fix.outer = ScalePoint::new(0.45, 6);
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = r#"
            [hires_fix]
            early_out = true
            interpolation = "area"
            inner = { stop_fraction = 0.2, depth = 1 }
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("deserialize config");
        assert!(cfg.hires_fix.early_out);
        assert_eq!(cfg.hires_fix.interpolation, InterpolationMode::Area);
        assert_eq!(cfg.hires_fix.inner, ScalePoint::new(0.2, 1));
        assert_eq!(cfg.hires_fix.outer, ScalePoint::new(0.3, 4));
        assert_eq!(cfg.hires_fix.indexing(), DecoderIndexing::Forward);
        assert_eq!(cfg.logging, LoggingConfig::default());
    }

    #[test]
    fn resolve_clamps_inverted_fractions() {
        let settings = HiresFixSettings {
            inner: ScalePoint::new(0.4, 2),
            outer: ScalePoint::new(0.1, 5),
            ..Default::default()
        };
        let config = settings.resolve().expect("resolve settings");
        assert_eq!(config.outer(), ScalePoint::new(0.4, 5));
        assert!(config.only_one_pass);
        assert!(config.smooth_scaling);
    }

    #[test]
    fn resolve_rejects_bad_factors_and_fractions() {
        let settings = HiresFixSettings {
            downscale: 0.0,
            ..Default::default()
        };
        let err = settings.resolve().err().expect("should fail");
        assert!(format!("{err:#}").contains("downscale must be a positive finite factor"));

        let settings = HiresFixSettings {
            upscale: f64::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = HiresFixSettings {
            upscale: 1e12,
            ..Default::default()
        };
        let err = settings.validate().err().expect("should fail");
        assert!(err.to_string().contains("upscale must be within [1, 4]"));

        let settings = HiresFixSettings {
            downscale: 0.05,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = HiresFixSettings {
            downscale: 0.1,
            upscale: 4.0,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = HiresFixSettings {
            outer: ScalePoint::new(1.5, 4),
            ..Default::default()
        };
        let err = settings.validate().err().expect("should fail");
        assert!(err.to_string().contains("outer stop_fraction must be within [0, 1]"));
    }

    #[test]
    fn load_missing_or_empty_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        assert_eq!(
            AppConfig::load_from_path(&path).expect("load missing"),
            AppConfig::default()
        );
        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(
            AppConfig::load_from_path(&path).expect("load empty"),
            AppConfig::default()
        );
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[hires_fix]\ninterpolation = \"lanczos\"\n").expect("write config");
        let err = AppConfig::load_from_path(&path).err().expect("should fail");
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_prefers_cli_override() {
        assert_eq!(data_dir(Some(Path::new("/custom"))), PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_and_default() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }
        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn initialize_writes_config_once() {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join("nested").join("data");

        assert!(initialize_data_dir(&data).expect("initialize data dir"));
        let cfg_path = config_path(&data);
        assert!(cfg_path.exists());
        assert_eq!(
            AppConfig::load_from_path(&cfg_path).expect("load written config"),
            AppConfig::default()
        );

        fs::write(&cfg_path, "[logging]\nretention_files = 3\n").expect("write custom config");
        assert!(!initialize_data_dir(&data).expect("initialize again"));
        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, "[logging]\nretention_files = 3\n");
    }
}
