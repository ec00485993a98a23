//! Configuration Loader
//!
//! Loads [`BusSettings`] from TOML with the `config` crate. A directory load
//! reads `base.toml` and then overlays `<environment>.toml` when present.
//! Environment variables prefixed with `SUBSCRIPTION_BUS__` override both,
//! e.g. `SUBSCRIPTION_BUS__POLLER__THROTTLE_TIMEOUT_MS=2000`.

use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use tracing::debug;

use super::BusSettings;
use crate::error::BusResult;

pub struct ConfigLoader;

impl ConfigLoader {
    pub const ENV_PREFIX: &'static str = "SUBSCRIPTION_BUS";

    /// Current environment name from `BUS_ENV` or `APP_ENV`
    pub fn detect_environment() -> String {
        std::env::var("BUS_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    /// Load a single TOML file
    pub fn from_file(path: impl AsRef<Path>) -> BusResult<BusSettings> {
        let path = path.as_ref();
        debug!(path = %path.display(), "📋 Loading bus configuration file");
        Self::finish(Config::builder().add_source(File::from(path).format(FileFormat::Toml)))
    }

    /// Load from TOML text
    pub fn from_toml_str(toml: &str) -> BusResult<BusSettings> {
        Self::finish(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    /// Load `base.toml` plus the optional `<environment>.toml` overlay
    pub fn from_directory(directory: impl AsRef<Path>, environment: &str) -> BusResult<BusSettings> {
        let directory = directory.as_ref();
        let overlay = directory.join(format!("{environment}.toml"));
        debug!(
            directory = %directory.display(),
            environment = %environment,
            overlay_present = overlay.exists(),
            "📋 Loading bus configuration directory"
        );

        Self::finish(
            Config::builder()
                .add_source(File::from(directory.join("base.toml")).format(FileFormat::Toml))
                .add_source(
                    File::from(overlay)
                        .format(FileFormat::Toml)
                        .required(false),
                ),
        )
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> BusResult<BusSettings> {
        let settings: BusSettings = builder
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }
}
