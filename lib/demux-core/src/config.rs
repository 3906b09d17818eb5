//! Loading and querying configuration.
use std::{path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Yaml},
    Figment, Provider as _,
};
use serde::de::DeserializeOwned;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Configuration file could not be read.
    #[snafu(display("Failed to read configuration file '{}': {}", path, source))]
    Io {
        /// Path to the configuration file.
        path: String,

        /// Error source.
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[snafu(display("Failed to parse configuration file '{}': {}", path, source))]
    Parse {
        /// Path to the configuration file.
        path: String,

        /// Error source.
        source: figment::Error,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: String,
    },

    /// Requested field did not have the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other error raised while querying the configuration.
    #[snafu(display("Failed to query configuration: {}", source))]
    Generic {
        /// Error source.
        source: figment::Error,
    },
}

/// Builds a [`GenericConfiguration`] from layered sources.
///
/// Sources added later take precedence over sources added earlier, so the usual order is configuration file first,
/// environment variables last.
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefixes: Vec<String>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            figment: Figment::new(),
            env_prefixes: Vec::new(),
        }
    }
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path).context(Io { path: path_str.clone() })?;
        let provider = Yaml::string(&contents);

        // Parse eagerly so that a malformed file is reported here and not on the first query.
        provider.data().context(Parse { path: path_str })?;

        self.figment = self.figment.admerge(provider);
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let figment = self.figment.clone();
        let env_prefixes = self.env_prefixes.clone();

        match self.from_yaml(&path) {
            Ok(loader) => loader,
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to load YAML configuration file. Ignoring.");
                Self { figment, env_prefixes }
            }
        }
    }

    /// Loads configuration from environment variables with the given prefix.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `DD` matches
    /// `DD_DOGSTATSD_PORT`, which is then exposed as `dogstatsd_port`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        self.figment = self.figment.admerge(Env::prefixed(&prefix));
        self.env_prefixes.push(prefix);
        Ok(self)
    }

    /// Adds a single key/value pair with the highest precedence so far.
    ///
    /// Mostly useful for command-line overrides and tests.
    pub fn with_value<V>(mut self, key: &str, value: V) -> Self
    where
        V: serde::Serialize,
    {
        self.figment = self.figment.admerge(figment::providers::Serialized::default(key, value));
        self
    }

    /// Consumes the loader, producing a queryable configuration.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                env_prefixes: self.env_prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: Vec<String>,
}

/// Merged configuration, queryable by key or as a whole.
///
/// Keys take the form `a.b.c`, where periods indicate nesting.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or its value cannot be deserialized as `T`, an error is returned.
    pub fn get_typed<T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => {
                // Environment variables can't express nesting, so `a.b` set through the environment shows up as `a_b`.
                let fallback_key = key.replace('.', "_");
                self.inner
                    .figment
                    .extract_inner(&fallback_key)
                    .map_err(|e| self.convert_error(key, e))
            }
            Err(e) => Err(self.convert_error(key, e)),
        }
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the value exists but cannot be deserialized as `T`, an error is returned.
    pub fn try_get_typed<T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        match self.get_typed(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `T`, an error is returned.
    pub fn as_typed<T>(&self) -> Result<T, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        self.inner.figment.extract().map_err(|e| self.convert_error("", e))
    }

    fn convert_error(&self, key: &str, e: figment::Error) -> ConfigurationError {
        match e.kind {
            Kind::MissingField(field) => {
                let field = if key.is_empty() { field.to_string() } else { key.to_string() };

                let mut valid_keys = vec![field.clone()];
                valid_keys.extend(
                    self.inner
                        .env_prefixes
                        .iter()
                        .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase())),
                );
                let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

                ConfigurationError::MissingField { help_text, field }
            }
            Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => ConfigurationError::Generic { source: e },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn yaml_values_are_queryable() {
        let file = yaml_file("dogstatsd_pipeline_count: 3\nnested:\n  flag: true\n");
        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();

        assert_eq!(config.get_typed::<i64>("dogstatsd_pipeline_count").unwrap(), 3);
        assert!(config.get_typed::<bool>("nested.flag").unwrap());
        assert_eq!(config.try_get_typed::<u16>("dogstatsd_port").unwrap(), None);
    }

    #[test]
    fn missing_file_is_ignored_by_try_variant() {
        let config = ConfigurationLoader::default()
            .try_from_yaml("/definitely/not/a/real/path.yaml")
            .with_value("hostname", "fallback")
            .into_generic();

        assert_eq!(config.get_typed::<String>("hostname").unwrap(), "fallback");
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let file = yaml_file("dogstatsd_port: [unterminated\n");
        let result = ConfigurationLoader::default().from_yaml(file.path());
        assert!(matches!(result, Err(ConfigurationError::Parse { .. })));
    }

    #[test]
    fn empty_environment_prefix_is_rejected() {
        let result = ConfigurationLoader::default().from_environment("");
        assert!(matches!(result, Err(ConfigurationError::EmptyPrefix)));
    }

    #[test]
    fn missing_field_help_mentions_environment_variable() {
        let config = ConfigurationLoader::default()
            .from_environment("DEMUXTEST")
            .unwrap()
            .into_generic();

        match config.get_typed::<u64>("aggregator_flush_interval") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("DEMUXTEST_AGGREGATOR_FLUSH_INTERVAL"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn later_sources_take_precedence() {
        let file = yaml_file("hostname: from-file\ndogstatsd_port: 9000\n");
        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .with_value("hostname", "from-override")
            .into_generic();

        assert_eq!(config.get_typed::<String>("hostname").unwrap(), "from-override");
        assert_eq!(config.get_typed::<u16>("dogstatsd_port").unwrap(), 9000);
    }

    #[test]
    fn invalid_type_is_reported() {
        let file = yaml_file("dogstatsd_port: not-a-number\n");
        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();

        assert!(matches!(
            config.get_typed::<u16>("dogstatsd_port"),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
    }
}
