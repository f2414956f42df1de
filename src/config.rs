//! Reading the configuration file and setting up logging.

use std::{
    env, fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::LevelFilter;
use serde::{de, Deserialize, Deserializer};

use crate::constants::{
    DEFAULT_LOG_LEVEL, DEFAULT_SIGNATURE_PLACEHOLDER_SIZE, EIDSIGN_ENV_LOG_LEVEL,
};
use crate::pin::PinSource;
use crate::signing::DigestAlgorithm;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn pin_source() -> PinSource {
        PinSource::Console
    }

    fn log_level() -> LevelFilter {
        DEFAULT_LOG_LEVEL
    }

    fn digest_algorithm() -> DigestAlgorithm {
        DigestAlgorithm::Sha256
    }

    fn placeholder_size() -> usize {
        DEFAULT_SIGNATURE_PLACEHOLDER_SIZE
    }
}


//------------ Config --------------------------------------------------------

/// The settings that can be kept in a config file.
///
/// Every key is optional. Command line options override what is set here.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The PKCS#11 module to load instead of probing the install locations.
    pub pkcs11_lib: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::pin_source")]
    pub pin_source: PinSource,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default)]
    pub signature: SignatureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pkcs11_lib: None,
            pin_source: ConfigDefaults::pin_source(),
            log_level: ConfigDefaults::log_level(),
            signature: SignatureConfig::default(),
        }
    }
}

impl Config {
    /// Reads the config file at `path`.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let mut s = String::new();
        let mut f = File::open(path).map_err(|e| {
            ConfigError::Other(format!("Cannot open config file '{}': {}", path.display(), e))
        })?;
        f.read_to_string(&mut s)?;
        Self::parse(&s)
    }

    /// Parses a config from its TOML text.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.verify()?;
        Ok(config)
    }

    /// Reads the config file if one is given, or returns the defaults.
    pub fn read_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::read(path),
            None => Ok(Self::default()),
        }
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.signature.placeholder_size < 1024 {
            return Err(ConfigError::other(
                "signature.placeholder_size must be at least 1024",
            ));
        }
        Ok(())
    }

    /// Applies the log level override of the command line or, failing
    /// that, of the environment.
    pub fn override_log_level(&mut self, cli: Option<LevelFilter>) -> Result<(), ConfigError> {
        if let Some(level) = cli {
            self.log_level = level;
        } else if let Ok(level) = env::var(EIDSIGN_ENV_LOG_LEVEL) {
            self.log_level = LevelFilter::from_str(&level).map_err(|_| {
                ConfigError::Other(format!(
                    "Unrecognized value for log level in env var {}",
                    EIDSIGN_ENV_LOG_LEVEL
                ))
            })?;
        }
        Ok(())
    }

    /// Installs the stderr logger.
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    fn fern_logger(&self) -> fern::Dispatch {
        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("lopdf", self.log_level.min(LevelFilter::Warn))
    }
}


//------------ SignatureConfig -----------------------------------------------

/// The `[signature]` table.
#[derive(Clone, Debug, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "ConfigDefaults::digest_algorithm")]
    pub digest_algorithm: DigestAlgorithm,

    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,

    /// The number of bytes reserved for the CMS signature.
    #[serde(default = "ConfigDefaults::placeholder_size")]
    pub placeholder_size: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        SignatureConfig {
            digest_algorithm: ConfigDefaults::digest_algorithm(),
            reason: None,
            location: None,
            contact_info: None,
            placeholder_size: ConfigDefaults::placeholder_size(),
        }
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ Tests ---------------------------------------------------------
