use std::{
    borrow::Cow,
    io,
    path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working
/// directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Environment variable for an absolute configuration directory override.
const CONFIG_DIR_ENV_VAR: &str = "MOLT_CONFIG_DIR";

/// Supported extensions for configuration files.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "MOLT";

const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Trait implemented by configuration structures that require list parsing
/// help when values arrive through environment variables.
pub trait Config {
    /// Keys whose values should be parsed as lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

#[derive(Debug, Clone, Copy)]
enum ConfigFileKind {
    Base,
    Environment(Environment),
}

impl ConfigFileKind {
    fn stem(&self) -> Cow<'static, str> {
        match self {
            ConfigFileKind::Base => Cow::Borrowed("base"),
            ConfigFileKind::Environment(env) => Cow::Owned(env.to_string()),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ConfigFileKind::Base => "base",
            ConfigFileKind::Environment(Environment::Dev) => "dev",
            ConfigFileKind::Environment(Environment::Staging) => "staging",
            ConfigFileKind::Environment(Environment::Prod) => "prod",
        }
    }
}

/// Errors that can occur while loading configuration files and overrides.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate {kind} configuration in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        kind: &'static str,
        directory: PathBuf,
        attempted: String,
    },

    #[error("failed to deserialize configuration")]
    Deserialization(#[source] config::ConfigError),

    #[error("failed to determine runtime environment")]
    Environment(#[source] io::Error),

    #[error("failed to initialize configuration builder")]
    Builder(#[source] config::ConfigError),
}

/// Loads hierarchical configuration from base, environment, and
/// environment-variable sources.
///
/// The configuration directory is `MOLT_CONFIG_DIR` when set, otherwise
/// `<current_dir>/configuration`. `base.(yaml|yml|json)` is merged with
/// `{environment}.(yaml|yml|json)` and then `MOLT_`-prefixed environment
/// variables; nested keys use double underscores (`MOLT_MIGRATION__TABLE`)
/// and list values are comma separated.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let configuration_directory = if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV_VAR) {
        PathBuf::from(config_dir)
    } else {
        let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
        base_path.join(CONFIGURATION_DIR)
    };

    if !configuration_directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            configuration_directory,
        ));
    }

    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    let base_file = find_configuration_file(&configuration_directory, ConfigFileKind::Base)?;
    let environment_file = find_configuration_file(
        &configuration_directory,
        ConfigFileKind::Environment(environment),
    )?;

    let mut environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source
            .try_parsing(true)
            .list_separator(LIST_SEPARATOR);

        for key in <T as Config>::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let builder = config::Config::builder()
        .add_source(config::File::from(base_file))
        .add_source(config::File::from(environment_file))
        .add_source(environment_source);

    let settings = builder.build().map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

fn find_configuration_file(
    directory: &Path,
    kind: ConfigFileKind,
) -> Result<PathBuf, LoadConfigError> {
    let stem = kind.stem();
    let mut attempted_paths = Vec::with_capacity(CONFIG_FILE_EXTENSIONS.len());

    for extension in CONFIG_FILE_EXTENSIONS {
        let path = directory.join(format!("{stem}.{extension}"));
        attempted_paths.push(path.clone());

        if path.is_file() {
            return Ok(path);
        }
    }

    let attempted = attempted_paths
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        kind: kind.as_str(),
        directory: directory.to_path_buf(),
        attempted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    /// Serializes tests that mutate process environment state.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct TestConfig {
        table: String,
        chunk_size: i64,
    }

    impl Config for TestConfig {
        const LIST_PARSE_KEYS: &'static [&'static str] = &[];
    }

    #[test]
    fn loads_and_merges_config_files() {
        let _guard = env_lock().lock().unwrap();

        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("config");
        fs::create_dir(&config_dir).unwrap();

        fs::write(config_dir.join("base.json"), r#"{"chunk_size": 1000}"#).unwrap();
        fs::write(
            config_dir.join("prod.json"),
            r#"{"table": "orders", "chunk_size": 2500}"#,
        )
        .unwrap();

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, config_dir.to_str().unwrap());
            std::env::set_var("MOLT_ENVIRONMENT", "prod");
        }

        let loaded: TestConfig = load_config().unwrap();
        assert_eq!(
            loaded,
            TestConfig {
                table: "orders".to_string(),
                chunk_size: 2500,
            }
        );

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
            std::env::remove_var("MOLT_ENVIRONMENT");
        }
    }

    #[test]
    fn missing_directory_is_an_error() {
        let _guard = env_lock().lock().unwrap();

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, "/definitely/not/a/directory");
        }
        let result = load_config::<TestConfig>();
        assert!(matches!(
            result,
            Err(LoadConfigError::MissingConfigurationDirectory(_))
        ));
        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
        }
    }
}
