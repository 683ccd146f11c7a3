use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory, relative to the working directory, holding the configuration files.
const CONFIGURATION_DIR: &str = "configuration";

/// Extensions probed, in order, for every configuration file.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Stem of the configuration file loaded in every environment.
const BASE_FILE_STEM: &str = "base";

/// Prefix of environment variable overrides, e.g. `APP_RETRY__MAX_ATTEMPTS`.
const ENV_PREFIX: &str = "APP";

/// Separator between [`ENV_PREFIX`] and the first key segment.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator between nested key segments in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Separator between list elements in environment variables.
const LIST_SEPARATOR: &str = ",";

/// Implemented by top level configuration structures that can be loaded with [`load_config`].
pub trait Config {
    /// Keys whose environment variable values are split into lists on [`LIST_SEPARATOR`].
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Errors returned by [`load_config`].
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not find `{stem}` configuration in `{directory}` (tried {attempted})")]
    ConfigurationFileMissing {
        stem: String,
        directory: PathBuf,
        attempted: String,
    },

    #[error("failed to load configuration file `{path}`: {source}")]
    ConfigurationFileLoad {
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),
}

/// Loads a configuration of type `T` from files and environment variables.
///
/// Sources are layered in this order, later ones overriding earlier ones:
/// 1. `configuration/base.{yaml,yml,json}`
/// 2. `configuration/{dev,prod}.{yaml,yml,json}` selected by `APP_ENVIRONMENT`
/// 3. `APP_`-prefixed environment variables, `__` separating nested keys
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from(&base_path.join(CONFIGURATION_DIR), environment)
}

/// Same as [`load_config`] but reads files from an explicit directory and environment.
pub fn load_config_from<T>(
    configuration_directory: &Path,
    environment: Environment,
) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !configuration_directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            configuration_directory.to_path_buf(),
        ));
    }

    let base_file = find_configuration_file(configuration_directory, BASE_FILE_STEM)?;
    let environment_file = find_configuration_file(configuration_directory, environment.as_str())?;

    let mut builder = rust_cli_config::Config::builder();
    for path in [base_file, environment_file] {
        builder = builder.add_source(rust_cli_config::File::from(path.clone()));

        // Building after every file attributes parse errors to the file that caused them.
        builder
            .build_cloned()
            .map_err(|source| LoadConfigError::ConfigurationFileLoad { path, source })?;
    }

    let settings = builder
        .add_source(environment_source::<T>())
        .build()
        .map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// Builds the `APP_` environment variable source for `T`.
fn environment_source<T: Config>() -> rust_cli_config::Environment {
    let mut source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        source = source.try_parsing(true).list_separator(LIST_SEPARATOR);

        for key in T::LIST_PARSE_KEYS {
            source = source.with_list_parse_key(key);
        }
    }

    source
}

fn find_configuration_file(directory: &Path, stem: &str) -> Result<PathBuf, LoadConfigError> {
    let candidates: Vec<PathBuf> = CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .collect();

    if let Some(path) = candidates.iter().find(|path| path.is_file()) {
        return Ok(path.clone());
    }

    let attempted = candidates
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        stem: stem.to_owned(),
        directory: directory.to_path_buf(),
        attempted,
    })
}
