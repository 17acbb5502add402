use serde::Deserialize;
use std::{fmt, fs, io, path::Path, str::FromStr};
use validator::{Validate, ValidationError};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown environment `{0}`, expected one of: dev, prd")]
    UnknownEnvironment(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// The closed set of deployment environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvName {
    Dev,
    Prd,
}

impl EnvName {
    pub const ALL: [EnvName; 2] = [EnvName::Dev, EnvName::Prd];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvName::Dev => "dev",
            EnvName::Prd => "prd",
        }
    }
}

impl fmt::Display for EnvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "dev" => Ok(EnvName::Dev),
            "prd" => Ok(EnvName::Prd),
            other => Err(Error::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Account and region a stack is deployed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEnvironment {
    pub account: String,
    pub region: String,
}

impl AccountEnvironment {
    /// `aws://<account>/<region>`, as written to the assembly manifest.
    pub fn uri(&self) -> String {
        format!("aws://{}/{}", self.account, self.region)
    }
}

/// One environment's entry in the configuration file.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ConfigEntry {
    #[validate(custom = "validate_account")]
    pub account: String,

    #[validate(length(min = 1))]
    pub region: String,

    #[validate(range(min = 1))]
    pub az_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    dev: ConfigEntry,
    prd: ConfigEntry,
}

/// Validated parameters of a single environment.
///
/// Only constructible through [`Config::new`], so every instance has passed
/// validation. Stacks receive it by shared reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    env_name: EnvName,
    env: AccountEnvironment,
    az_count: u32,
}

impl Config {
    pub fn new(env_name: EnvName, entry: ConfigEntry) -> Result<Self, Error> {
        match entry.validate() {
            Ok(_) => (),
            Err(error) => {
                return Err(Error::ValidationError(format!("{}: {}", env_name, error)))
            }
        }

        return Ok(Self {
            env_name,
            env: AccountEnvironment {
                account: entry.account,
                region: entry.region,
            },
            az_count: entry.az_count,
        });
    }

    pub fn env_name(&self) -> EnvName {
        self.env_name
    }

    pub fn env(&self) -> &AccountEnvironment {
        &self.env
    }

    pub fn az_count(&self) -> u32 {
        self.az_count
    }
}

/// Exactly one [`Config`] per [`EnvName`], built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRegistry {
    dev: Config,
    prd: Config,
}

impl ConfigRegistry {
    pub fn new(dev: Config, prd: Config) -> Result<Self, Error> {
        if dev.env_name != EnvName::Dev || prd.env_name != EnvName::Prd {
            return Err(Error::ValidationError(String::from(
                "registry entries must match their environment names",
            )));
        }

        return Ok(Self { dev, prd });
    }

    /// Defaults used when no configuration file is given.
    pub fn builtin() -> Self {
        Self {
            dev: Config {
                env_name: EnvName::Dev,
                env: AccountEnvironment {
                    account: String::from("123456789012"),
                    region: String::from("eu-west-1"),
                },
                az_count: 2,
            },
            prd: Config {
                env_name: EnvName::Prd,
                env: AccountEnvironment {
                    account: String::from("210987654321"),
                    region: String::from("eu-west-1"),
                },
                az_count: 3,
            },
        }
    }

    pub fn get(&self, env_name: EnvName) -> &Config {
        match env_name {
            EnvName::Dev => &self.dev,
            EnvName::Prd => &self.prd,
        }
    }

    pub fn lookup(&self, name: &str) -> Result<&Config, Error> {
        let env_name = EnvName::from_str(name)?;
        return Ok(self.get(env_name));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Config> {
        [&self.dev, &self.prd].into_iter()
    }
}

pub fn parse(path: &Path) -> Result<ConfigRegistry, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let file: ConfigFile = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    let dev = Config::new(EnvName::Dev, file.dev)?;
    let prd = Config::new(EnvName::Prd, file.prd)?;

    return ConfigRegistry::new(dev, prd);
}

fn validate_account(account: &str) -> Result<(), ValidationError> {
    if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new(
            "The account id has to be exactly 12 digits",
        ));
    }

    return Ok(());
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::str::FromStr;

    use super::parse;
    use super::Config;
    use super::ConfigEntry;
    use super::ConfigRegistry;
    use super::EnvName;
    use super::Error;
    use tempfile::tempdir;

    fn entry(account: &str, az_count: u32) -> ConfigEntry {
        ConfigEntry {
            account: String::from(account),
            region: String::from("eu-west-1"),
            az_count,
        }
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", contents).unwrap();

        (dir, file_path)
    }

    #[test]
    fn file_does_not_exist() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let result = parse(&file_path);
        match result.err().unwrap() {
            Error::FileNotFound(_) => {}
            _ => panic!("Expected `FileNotFound` error"),
        }
    }

    #[test]
    fn file_wrong_format() {
        let (_dir, file_path) = write_config("Not yaml");

        let result = parse(&file_path);
        match result.err().unwrap() {
            Error::ParsingError(_) => {}
            _ => panic!("Expected `ParsingError` error"),
        }
    }

    #[test]
    fn file_missing_environment() {
        let (_dir, file_path) = write_config(
            "dev:\n  account: \"123456789012\"\n  region: eu-west-1\n  az_count: 2\n",
        );

        let result = parse(&file_path);
        match result.err().unwrap() {
            Error::ParsingError(message) => assert!(message.contains("prd")),
            _ => panic!("Expected `ParsingError` error"),
        }
    }

    #[test]
    fn file_with_unknown_environment() {
        let (_dir, file_path) = write_config(concat!(
            "dev:\n  account: \"123456789012\"\n  region: eu-west-1\n  az_count: 2\n",
            "prd:\n  account: \"123456789012\"\n  region: eu-west-1\n  az_count: 3\n",
            "staging:\n  account: \"123456789012\"\n  region: eu-west-1\n  az_count: 1\n",
        ));

        let result = parse(&file_path);
        match result.err().unwrap() {
            Error::ParsingError(message) => assert!(message.contains("staging")),
            _ => panic!("Expected `ParsingError` error"),
        }
    }

    #[test]
    fn file_with_zero_az_count() {
        let (_dir, file_path) = write_config(concat!(
            "dev:\n  account: \"123456789012\"\n  region: eu-west-1\n  az_count: 0\n",
            "prd:\n  account: \"123456789012\"\n  region: eu-west-1\n  az_count: 3\n",
        ));

        let result = parse(&file_path);
        match result.err().unwrap() {
            Error::ValidationError(message) => assert!(message.starts_with("dev")),
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn parses_the_config() {
        let (_dir, file_path) = write_config(concat!(
            "dev:\n  account: \"111111111111\"\n  region: us-east-1\n  az_count: 2\n",
            "prd:\n  account: \"222222222222\"\n  region: eu-central-1\n  az_count: 3\n",
        ));

        let registry = parse(&file_path).unwrap();
        let prd = registry.get(EnvName::Prd);
        assert_eq!(prd.env_name(), EnvName::Prd);
        assert_eq!(prd.env().account, "222222222222");
        assert_eq!(prd.env().region, "eu-central-1");
        assert_eq!(prd.az_count(), 3);
    }

    #[test]
    fn rejects_malformed_account() {
        let result = Config::new(EnvName::Dev, entry("12345", 2));
        match result.err().unwrap() {
            Error::ValidationError(_) => {}
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn registry_rejects_swapped_entries() {
        let dev = Config::new(EnvName::Dev, entry("123456789012", 2)).unwrap();
        let prd = Config::new(EnvName::Prd, entry("123456789012", 3)).unwrap();

        assert!(ConfigRegistry::new(prd, dev).is_err());
    }

    #[test]
    fn lookup_covers_every_environment() {
        let registry = ConfigRegistry::builtin();

        for env_name in EnvName::ALL {
            let config = registry.lookup(env_name.as_str()).unwrap();
            assert_eq!(config.env_name(), env_name);
            assert!(config.az_count() >= 1);
            assert_eq!(config.env().account.len(), 12);
            assert!(!config.env().region.is_empty());
        }
    }

    #[test]
    fn lookup_rejects_unknown_environment() {
        let registry = ConfigRegistry::builtin();

        assert_eq!(
            registry.lookup("staging").err().unwrap(),
            Error::UnknownEnvironment(String::from("staging"))
        );
        assert!(EnvName::from_str("DEV").is_err());
    }
}
