//! Loading and validation of the node configuration.
//!
//! Settings are read from a TOML file and can be overridden through
//! environment variables prefixed with `CMIX`, with `__` separating the
//! section from the key (for example `CMIX_NODE__KEEP_BUFFERS=true`).

use std::{fmt, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    group::{params, CyclicGroup, GroupError},
    round::topology::NodeId,
};

#[derive(Debug, Error)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[validate]
    pub node: NodeSettings,
    #[validate]
    #[serde(default)]
    pub round: RoundSettings,
    #[validate]
    #[serde(default)]
    pub group: GroupSettings,
    #[validate]
    pub permissioning: PermissioningSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// fails.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path))?;
        config.merge(Environment::with_prefix("cmix").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Validate, Deserialize)]
#[serde(deny_unknown_fields)]
/// The identity of this node and its local storage switches.
pub struct NodeSettings {
    /// The hex-encoded identity of this node, as listed in the circuit
    /// topology of every round descriptor.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// id = "6f01"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CMIX_NODE__ID=6f01
    /// ```
    #[serde(deserialize_with = "deserialize_hex_bytes")]
    pub id: Vec<u8>,

    /// Whether round buffers are kept in memory after the round completes,
    /// instead of being erased and released.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// keep_buffers = false
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CMIX_NODE__KEEP_BUFFERS=false
    /// ```
    #[serde(default)]
    pub keep_buffers: bool,

    /// Reserved: run phase graphs on a GPU backend. Currently unsupported
    /// and ignored with a warning at startup.
    #[serde(default)]
    pub use_gpu: bool,

    /// Reserved: disable streamed chunk hand-off between modules. Currently
    /// unsupported and ignored with a warning at startup.
    #[serde(default)]
    pub disable_streaming: bool,

    /// Where a crash note is written when a round fails. On the next start
    /// the note is consumed and logged.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// recovered_error_path = "/var/lib/cmix/recovered-error"
    /// ```
    #[serde(default)]
    pub recovered_error_path: Option<PathBuf>,

    /// The hex-encoded 32-byte seed of the node's RNG stream generator.
    /// Sampled from the operating system when unset; set it only to make a
    /// test deployment reproducible.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// rng_seed = "0707…0707"
    /// ```
    #[serde(default, deserialize_with = "deserialize_opt_seed")]
    pub rng_seed: Option<[u8; 32]>,

    /// The path to the TLS certificate presented to peers. Consumed by the
    /// transport layer, not by this crate.
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,

    /// The path to the TLS key matching [`tls_certificate`].
    ///
    /// [`tls_certificate`]: NodeSettings::tls_certificate
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl NodeSettings {
    /// The parsed node identity.
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.id.clone())
    }
}

#[derive(Debug, Validate, Deserialize)]
#[serde(deny_unknown_fields)]
/// Timeouts and sizes governing round execution.
pub struct RoundSettings {
    /// How long a round may sit between its creation and its first queued
    /// phase before it is considered stuck, in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// creation_timeout_secs = 120
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CMIX_ROUND__CREATION_TIMEOUT_SECS=120
    /// ```
    #[validate(range(min = 1))]
    pub creation_timeout_secs: u64,

    /// The fallback phase timeout on the resource queue, in milliseconds,
    /// used when a round descriptor does not carry its own.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// resource_queue_timeout_millis = 30000
    /// ```
    #[validate(range(min = 1))]
    pub resource_queue_timeout_millis: u64,

    /// The batch size for locally created test rounds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// default_batch_size = 32
    /// ```
    #[validate(range(min = 1))]
    pub default_batch_size: u32,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            creation_timeout_secs: 120,
            resource_queue_timeout_millis: 30_000,
            default_batch_size: 32,
        }
    }
}

#[derive(Debug, Validate, Deserialize)]
#[serde(deny_unknown_fields)]
/// The cyclic group all round arithmetic happens in.
///
/// All three parameters are big-endian hex strings, as they appear in the
/// signed network-definition document. The defaults are the 2048-bit MODP
/// group of RFC 3526.
pub struct GroupSettings {
    /// The large prime `p`.
    #[validate(custom = "validate_hex")]
    pub prime: String,

    /// The generator `g`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [group]
    /// generator = "2"
    /// ```
    #[validate(custom = "validate_hex")]
    pub generator: String,

    /// The small prime `q` used for coprime exponent sampling.
    #[validate(custom = "validate_hex")]
    pub prime_q: String,
}

impl GroupSettings {
    /// The parsed group.
    ///
    /// # Errors
    /// Fails when a parameter is not a valid big-endian hex integer.
    pub fn group(&self) -> Result<CyclicGroup, GroupError> {
        CyclicGroup::from_hex(&self.prime, &self.generator, &self.prime_q)
    }
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            prime: params::MODP_2048_PRIME.to_string(),
            generator: params::MODP_2048_GENERATOR.to_string(),
            prime_q: params::MODP_2048_Q.to_string(),
        }
    }
}

#[derive(Debug, Validate, Deserialize)]
#[serde(deny_unknown_fields)]
/// The permissioning service that issues signed round descriptors.
pub struct PermissioningSettings {
    /// The address of the permissioning service.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [permissioning]
    /// address = "permissioning.example.org:11420"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CMIX_PERMISSIONING__ADDRESS=permissioning.example.org:11420
    /// ```
    #[validate(length(min = 1))]
    pub address: String,

    /// The hex-encoded Ed25519 verifying key round descriptors must be
    /// signed with.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [permissioning]
    /// verifying_key = "2ab0…d7f1"
    /// ```
    #[serde(deserialize_with = "deserialize_verifying_key")]
    pub verifying_key: [u8; 32],
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
/// Settings for the metrics log.
pub struct MetricsSettings {
    /// Where per-module runtime measurements are appended after each round.
    /// Metrics are disabled when unset.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [metrics]
    /// log_path = "/var/log/cmix/metrics.log"
    /// ```
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
/// Settings for logging.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "cmix_node=debug,info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CMIX_LOG__FILTER=cmix_node=debug,info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn validate_hex(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ValidationError::new("invalid_hex"));
    }
    Ok(())
}

fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    struct HexBytesVisitor;

    impl<'de> Visitor<'de> for HexBytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a non-empty hex string")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let bytes = hex::decode(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))?;
            if bytes.is_empty() {
                return Err(de::Error::invalid_value(de::Unexpected::Str(value), &self));
            }
            Ok(bytes)
        }
    }

    deserializer.deserialize_str(HexBytesVisitor)
}

fn deserialize_opt_seed<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Option::<String>::deserialize(deserializer)? {
        Some(value) => value,
        None => return Ok(None),
    };
    let bytes = hex::decode(&value)
        .map_err(|_| de::Error::custom("the RNG seed is not a hex string"))?;
    let mut seed = [0u8; 32];
    if bytes.len() != seed.len() {
        return Err(de::Error::custom("the RNG seed must be 32 bytes"));
    }
    seed.copy_from_slice(&bytes);
    Ok(Some(seed))
}

fn deserialize_verifying_key<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
where
    D: Deserializer<'de>,
{
    struct VerifyingKeyVisitor;

    impl<'de> Visitor<'de> for VerifyingKeyVisitor {
        type Value = [u8; 32];

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a 64-character hex string")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let bytes = hex::decode(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))?;
            let mut key = [0u8; 32];
            if bytes.len() != key.len() {
                return Err(de::Error::invalid_value(de::Unexpected::Str(value), &self));
            }
            key.copy_from_slice(&bytes);
            Ok(key)
        }
    }

    deserializer.deserialize_str(VerifyingKeyVisitor)
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.9/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
        [node]
        id = "6f01"

        [permissioning]
        address = "permissioning.example.org:11420"
        verifying_key = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a"
    "#;

    #[test]
    fn minimal_config_falls_back_to_defaults() {
        let file = write_config(MINIMAL);
        let settings = Settings::new(file.path().to_path_buf()).unwrap();

        assert_eq!(settings.node.id, vec![0x6f, 0x01]);
        assert!(!settings.node.keep_buffers);
        assert!(settings.node.rng_seed.is_none());
        assert_eq!(settings.round.default_batch_size, 32);
        assert_eq!(settings.round.resource_queue_timeout_millis, 30_000);
        assert_eq!(settings.permissioning.verifying_key, [0x2a; 32]);

        let group = settings.group.group().unwrap();
        assert_eq!(group.prime().bits(), 2048);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config(
            r#"
            [node]
            id = "6f01"
            keep_buffres = true

            [permissioning]
            address = "a:1"
            verifying_key = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a"
            "#,
        );
        assert!(matches!(
            Settings::new(file.path().to_path_buf()),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    fn malformed_hex_identity_is_rejected() {
        let file = write_config(
            r#"
            [node]
            id = "not hex"

            [permissioning]
            address = "a:1"
            verifying_key = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a"
            "#,
        );
        assert!(matches!(
            Settings::new(file.path().to_path_buf()),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    fn short_verifying_key_is_rejected() {
        let file = write_config(
            r#"
            [node]
            id = "6f01"

            [permissioning]
            address = "a:1"
            verifying_key = "2a2a"
            "#,
        );
        assert!(matches!(
            Settings::new(file.path().to_path_buf()),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    fn a_full_seed_parses() {
        let file = write_config(
            r#"
            [node]
            id = "6f01"
            rng_seed = "0707070707070707070707070707070707070707070707070707070707070707"

            [permissioning]
            address = "a:1"
            verifying_key = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a"
            "#,
        );
        let settings = Settings::new(file.path().to_path_buf()).unwrap();
        assert_eq!(settings.node.rng_seed, Some([7u8; 32]));
    }

    #[test]
    fn zero_timeouts_fail_validation() {
        let file = write_config(
            r#"
            [node]
            id = "6f01"

            [round]
            creation_timeout_secs = 0
            resource_queue_timeout_millis = 30000
            default_batch_size = 32

            [permissioning]
            address = "a:1"
            verifying_key = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a"
            "#,
        );
        assert!(matches!(
            Settings::new(file.path().to_path_buf()),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn group_parameters_must_be_hex() {
        let file = write_config(
            r#"
            [node]
            id = "6f01"

            [group]
            prime = "xyz"
            generator = "2"
            prime_q = "10001"

            [permissioning]
            address = "a:1"
            verifying_key = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a"
            "#,
        );
        assert!(matches!(
            Settings::new(file.path().to_path_buf()),
            Err(SettingsError::Validation(_))
        ));
    }
}
