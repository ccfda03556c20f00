use anyhow::Context;
use config::{Config, Environment, File, FileFormat, Source};
use serde::de::DeserializeOwned;
use std::path::Path;

const ENV_PREFIX: &str = "APP";

/// Loads `configuration/base.yaml` relative to the working directory and
/// overlays `APP_`-prefixed environment variables on top of it,
/// e.g. `APP_CHANNEL__URL=amqp://...` overrides `channel.url`.
pub fn config<Settings: DeserializeOwned>() -> anyhow::Result<Settings> {
    let base_path = std::env::current_dir().context("Failed to determine the current directory")?;
    config_from_directory(&base_path.join("configuration"))
}

pub fn config_from_directory<Settings: DeserializeOwned>(
    configuration_directory: &Path,
) -> anyhow::Result<Settings> {
    let file = configuration_directory.join("base.yaml");
    build(File::from(file))
}

/// Same layering as [`config`] but with the yaml document supplied inline.
pub fn config_from_yaml<Settings: DeserializeOwned>(yaml: &str) -> anyhow::Result<Settings> {
    build(File::from_str(yaml, FileFormat::Yaml))
}

fn build<Settings, S>(file: S) -> anyhow::Result<Settings>
where
    Settings: DeserializeOwned,
    S: Source + Send + Sync + 'static,
{
    let settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Failed to build configuration")?;

    settings
        .try_deserialize::<Settings>()
        .context("Failed to deserialize settings")
}
