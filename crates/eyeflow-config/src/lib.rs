// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the EyeFlow kernel.
//!
//! A top-level [`EyeflowConfig`] struct, TOML file loading, an
//! environment-variable overlay for every recognized option, advisory
//! [`ConfigWarning`]s, and a `thiserror`-derived [`ConfigError`]. Every
//! other `eyeflow-*` crate takes its tunables as explicit constructor
//! arguments rather than
//! reading the environment itself; this crate is the only place
//! `std::env::var` appears in the workspace outside `eyeflow-cli` and
//! `eyeflow-daemon`'s argument parsing.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The scratch buffer is configured unusually large.
    LargeScratchBuffer {
        /// Configured size in bytes.
        bytes: usize,
    },
    /// The offline buffer's retry interval is unusually long.
    LongRetryInterval {
        /// Configured interval in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeScratchBuffer { bytes } => {
                write!(f, "vm.scratch_buffer_bytes is unusually large ({bytes} bytes)")
            }
            ConfigWarning::LongRetryInterval { secs } => {
                write!(f, "offline_buffer.retry_interval_secs is unusually long ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for an EyeFlow node.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EyeflowConfig {
    /// Node identity stamped into every audit event (`SVM_NODE_ID`).
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Ed25519 signing key material for the audit chain and preloader.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Kafka-backed audit export and CDC consumption.
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Remote secret store.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Local offline buffering for audit/result/trigger events.
    #[serde(default)]
    pub offline_buffer: OfflineBufferConfig,

    /// Virtual machine tunables.
    #[serde(default)]
    pub vm: VmConfig,

    /// Degrade the cancellation bus to a local always-`false` timer
    /// (`CANCELLATION_BUS_DISABLED`).
    #[serde(default)]
    pub cancellation_bus_disabled: bool,
}

fn default_node_id() -> String {
    "eyeflow-node-1".to_string()
}

impl Default for EyeflowConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            signing: SigningConfig::default(),
            kafka: KafkaConfig::default(),
            vault: VaultConfig::default(),
            offline_buffer: OfflineBufferConfig::default(),
            vm: VmConfig::default(),
            cancellation_bus_disabled: false,
        }
    }
}

/// Persistent Ed25519 signing key material (
/// `SVM_SIGNING_PRIVATE_KEY_PEM` / `SVM_SIGNING_PUBLIC_KEY_PEM`). When both
/// are absent the composition root generates an ephemeral key pair for the
/// process lifetime.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SigningConfig {
    /// PEM-encoded Ed25519 private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
    /// PEM-encoded Ed25519 public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
}

/// Kafka enablement and topology (`KAFKA_*`).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Enables the audit exporter's broker connection and the CDC consumer.
    #[serde(default)]
    pub enabled: bool,
    /// Broker addresses (`KAFKA_BROKERS`, comma-separated on the wire).
    #[serde(default)]
    pub brokers: Vec<String>,
    /// Audit event topic override (`KAFKA_AUDIT_TOPIC`).
    #[serde(default = "default_audit_topic")]
    pub audit_topic: String,
}

fn default_audit_topic() -> String {
    "audit-events".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            brokers: Vec::new(),
            audit_topic: default_audit_topic(),
        }
    }
}

/// Remote vault connection (`VAULT_*`).
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VaultConfig {
    /// Base address of the remote vault (`VAULT_ADDR`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    /// Auth token for the remote vault (`VAULT_TOKEN`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Optional namespace scoping (`VAULT_NAMESPACE`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Offline buffer tunables (`OFFLINE_BUFFER_*`).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OfflineBufferConfig {
    /// On-disk path for the newline-delimited JSON queue (`OFFLINE_BUFFER_PATH`).
    #[serde(default = "default_buffer_path")]
    pub path: String,
    /// Bound on queued events before the oldest is dropped (`OFFLINE_BUFFER_MAX`).
    #[serde(default = "default_buffer_max")]
    pub max_queue_size: usize,
    /// Retry poll interval in seconds while disconnected (`OFFLINE_BUFFER_RETRY_MS`,
    /// stored here in whole seconds for readability in TOML).
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_buffer_path() -> String {
    ".eyeflow/offline-buffer.ndjson".to_string()
}

fn default_buffer_max() -> usize {
    10_000
}

fn default_retry_interval_secs() -> u64 {
    15
}

impl Default for OfflineBufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
            max_queue_size: default_buffer_max(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

/// Semantic virtual machine tunables. The scratch buffer size is a
/// configuration knob per a configuration knob so operators can size it.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VmConfig {
    /// Scratch buffer budget in bytes ("10 MiB scratch buffer").
    #[serde(default = "default_scratch_buffer_bytes")]
    pub scratch_buffer_bytes: usize,
}

fn default_scratch_buffer_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            scratch_buffer_bytes: default_scratch_buffer_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Threshold above which a scratch buffer generates a warning (128 MiB).
const LARGE_SCRATCH_BUFFER_THRESHOLD: usize = 128 * 1024 * 1024;

/// Threshold above which a retry interval generates a warning (10 minutes).
const LONG_RETRY_INTERVAL_THRESHOLD_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`EyeflowConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`EyeflowConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] if `path` is given but does not
/// exist, or [`ConfigError::ParseError`] if its contents are not valid
/// TOML matching this shape.
pub fn load_config(path: Option<&Path>) -> Result<EyeflowConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => EyeflowConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`EyeflowConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] if `content` is not valid TOML, or
/// does not match this shape's field types.
pub fn parse_toml(content: &str) -> Result<EyeflowConfig, ConfigError> {
    toml::from_str::<EyeflowConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides, per the recognized options:
///
/// - `SVM_NODE_ID`
/// - `SVM_SIGNING_PRIVATE_KEY_PEM`, `SVM_SIGNING_PUBLIC_KEY_PEM`
/// - `KAFKA_ENABLED`, `KAFKA_BROKERS`, `KAFKA_AUDIT_TOPIC`
/// - `VAULT_ADDR`, `VAULT_TOKEN`, `VAULT_NAMESPACE`
/// - `OFFLINE_BUFFER_PATH`, `OFFLINE_BUFFER_MAX`, `OFFLINE_BUFFER_RETRY_MS`
/// - `CANCELLATION_BUS_DISABLED`
pub fn apply_env_overrides(config: &mut EyeflowConfig) {
    if let Ok(val) = std::env::var("SVM_NODE_ID") {
        config.node_id = val;
    }
    if let Ok(val) = std::env::var("SVM_SIGNING_PRIVATE_KEY_PEM") {
        config.signing.private_key_pem = Some(val);
    }
    if let Ok(val) = std::env::var("SVM_SIGNING_PUBLIC_KEY_PEM") {
        config.signing.public_key_pem = Some(val);
    }
    if let Ok(val) = std::env::var("KAFKA_ENABLED") {
        config.kafka.enabled = val.eq_ignore_ascii_case("true") || val == "1";
    }
    if let Ok(val) = std::env::var("KAFKA_BROKERS") {
        config.kafka.brokers = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Ok(val) = std::env::var("KAFKA_AUDIT_TOPIC") {
        config.kafka.audit_topic = val;
    }
    if let Ok(val) = std::env::var("VAULT_ADDR") {
        config.vault.addr = Some(val);
    }
    if let Ok(val) = std::env::var("VAULT_TOKEN") {
        config.vault.token = Some(val);
    }
    if let Ok(val) = std::env::var("VAULT_NAMESPACE") {
        config.vault.namespace = Some(val);
    }
    if let Ok(val) = std::env::var("OFFLINE_BUFFER_PATH") {
        config.offline_buffer.path = val;
    }
    if let Ok(val) = std::env::var("OFFLINE_BUFFER_MAX") {
        if let Ok(n) = val.parse() {
            config.offline_buffer.max_queue_size = n;
        }
    }
    if let Ok(val) = std::env::var("OFFLINE_BUFFER_RETRY_MS") {
        if let Ok(ms) = val.parse::<u64>() {
            config.offline_buffer.retry_interval_secs = ms.div_ceil(1000).max(1);
        }
    }
    if let Ok(val) = std::env::var("CANCELLATION_BUS_DISABLED") {
        config.cancellation_bus_disabled = val.eq_ignore_ascii_case("true") || val == "1";
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (Kafka enabled with no brokers, zero-valued bounds) come
/// back as a [`ConfigError::ValidationError`]; soft issues come back as
/// warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] carrying every problem found,
/// not just the first.
pub fn validate_config(config: &EyeflowConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.node_id.trim().is_empty() {
        errors.push("node_id must not be empty".into());
    }

    if config.kafka.enabled && config.kafka.brokers.is_empty() {
        errors.push("kafka.enabled is true but kafka.brokers is empty".into());
    }

    if config.offline_buffer.max_queue_size == 0 {
        errors.push("offline_buffer.max_queue_size must be greater than zero".into());
    }
    if config.offline_buffer.retry_interval_secs == 0 {
        errors.push("offline_buffer.retry_interval_secs must be greater than zero".into());
    } else if config.offline_buffer.retry_interval_secs > LONG_RETRY_INTERVAL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LongRetryInterval {
            secs: config.offline_buffer.retry_interval_secs,
        });
    }

    if config.vm.scratch_buffer_bytes == 0 {
        errors.push("vm.scratch_buffer_bytes must be greater than zero".into());
    } else if config.vm.scratch_buffer_bytes > LARGE_SCRATCH_BUFFER_THRESHOLD {
        warnings.push(ConfigWarning::LargeScratchBuffer {
            bytes: config.vm.scratch_buffer_bytes,
        });
    }

    if config.signing.private_key_pem.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "signing.private_key_pem".into(),
            hint: "an ephemeral signing key will be generated for this process only".into(),
        });
    }
    if config.vault.addr.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "vault.addr".into(),
            hint: "secrets will only resolve through env-var fallbacks".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Scalar values in `overlay` take precedence
/// over `base`; `kafka.brokers` is replaced wholesale rather than
/// concatenated (a broker list is a complete topology, not an additive set).
#[must_use]
pub fn merge_configs(base: EyeflowConfig, overlay: EyeflowConfig) -> EyeflowConfig {
    EyeflowConfig {
        node_id: if overlay.node_id != default_node_id() {
            overlay.node_id
        } else {
            base.node_id
        },
        signing: SigningConfig {
            private_key_pem: overlay.signing.private_key_pem.or(base.signing.private_key_pem),
            public_key_pem: overlay.signing.public_key_pem.or(base.signing.public_key_pem),
        },
        kafka: KafkaConfig {
            enabled: overlay.kafka.enabled || base.kafka.enabled,
            brokers: if overlay.kafka.brokers.is_empty() {
                base.kafka.brokers
            } else {
                overlay.kafka.brokers
            },
            audit_topic: if overlay.kafka.audit_topic != default_audit_topic() {
                overlay.kafka.audit_topic
            } else {
                base.kafka.audit_topic
            },
        },
        vault: VaultConfig {
            addr: overlay.vault.addr.or(base.vault.addr),
            token: overlay.vault.token.or(base.vault.token),
            namespace: overlay.vault.namespace.or(base.vault.namespace),
        },
        offline_buffer: OfflineBufferConfig {
            path: if overlay.offline_buffer.path != default_buffer_path() {
                overlay.offline_buffer.path
            } else {
                base.offline_buffer.path
            },
            max_queue_size: if overlay.offline_buffer.max_queue_size != default_buffer_max() {
                overlay.offline_buffer.max_queue_size
            } else {
                base.offline_buffer.max_queue_size
            },
            retry_interval_secs: if overlay.offline_buffer.retry_interval_secs != default_retry_interval_secs() {
                overlay.offline_buffer.retry_interval_secs
            } else {
                base.offline_buffer.retry_interval_secs
            },
        },
        vm: VmConfig {
            scratch_buffer_bytes: if overlay.vm.scratch_buffer_bytes != default_scratch_buffer_bytes() {
                overlay.vm.scratch_buffer_bytes
            } else {
                base.vm.scratch_buffer_bytes
            },
        },
        cancellation_bus_disabled: overlay.cancellation_bus_disabled || base.cancellation_bus_disabled,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = EyeflowConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(!warnings.is_empty(), "should have advisory warnings");
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = EyeflowConfig::default();
        assert_eq!(cfg.node_id, "eyeflow-node-1");
        assert_eq!(cfg.vm.scratch_buffer_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.offline_buffer.max_queue_size, 10_000);
        assert!(!cfg.kafka.enabled);
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            node_id = "node-east-1"

            [kafka]
            enabled = true
            brokers = ["broker-1:9092", "broker-2:9092"]

            [vault]
            addr = "https://vault.internal:8200"
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.node_id, "node-east-1");
        assert!(cfg.kafka.enabled);
        assert_eq!(cfg.kafka.brokers.len(), 2);
        assert_eq!(cfg.vault.addr.as_deref(), Some("https://vault.internal:8200"));
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn parse_wrong_types_gives_parse_error() {
        let toml_str = r#"node_id = 42"#;
        let err = parse_toml(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_kafka_enabled_with_no_brokers() {
        let mut cfg = EyeflowConfig::default();
        cfg.kafka.enabled = true;
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("brokers is empty")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_empty_node_id() {
        let mut cfg = EyeflowConfig::default();
        cfg.node_id = "  ".into();
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_max_queue_size() {
        let mut cfg = EyeflowConfig::default();
        cfg.offline_buffer.max_queue_size = 0;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_scratch_buffer() {
        let mut cfg = EyeflowConfig::default();
        cfg.vm.scratch_buffer_bytes = 0;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_warns_on_large_scratch_buffer() {
        let mut cfg = EyeflowConfig::default();
        cfg.vm.scratch_buffer_bytes = 256 * 1024 * 1024;
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeScratchBuffer { .. })));
    }

    #[test]
    fn validation_warns_on_long_retry_interval() {
        let mut cfg = EyeflowConfig::default();
        cfg.offline_buffer.retry_interval_secs = 900;
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LongRetryInterval { .. })));
    }

    #[test]
    fn valid_config_with_kafka_and_vault_passes() {
        let mut cfg = EyeflowConfig::default();
        cfg.kafka.enabled = true;
        cfg.kafka.brokers = vec!["broker:9092".into()];
        cfg.vault.addr = Some("https://vault:8200".into());
        validate_config(&cfg).expect("should pass");
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        // SAFETY-free: this test mutates process env, scoped to variables
        // this crate itself reads, and restores them afterward.
        std::env::set_var("SVM_NODE_ID", "env-node");
        std::env::set_var("KAFKA_ENABLED", "true");
        std::env::set_var("KAFKA_BROKERS", "a:9092, b:9092");
        std::env::set_var("CANCELLATION_BUS_DISABLED", "1");

        let mut cfg = EyeflowConfig::default();
        apply_env_overrides(&mut cfg);

        assert_eq!(cfg.node_id, "env-node");
        assert!(cfg.kafka.enabled);
        assert_eq!(cfg.kafka.brokers, vec!["a:9092".to_string(), "b:9092".to_string()]);
        assert!(cfg.cancellation_bus_disabled);

        std::env::remove_var("SVM_NODE_ID");
        std::env::remove_var("KAFKA_ENABLED");
        std::env::remove_var("KAFKA_BROKERS");
        std::env::remove_var("CANCELLATION_BUS_DISABLED");
    }

    #[test]
    fn offline_buffer_retry_ms_env_rounds_up_to_seconds() {
        std::env::set_var("OFFLINE_BUFFER_RETRY_MS", "1500");
        let mut cfg = EyeflowConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.offline_buffer.retry_interval_secs, 2);
        std::env::remove_var("OFFLINE_BUFFER_RETRY_MS");
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let base = EyeflowConfig {
            node_id: "base-node".into(),
            ..Default::default()
        };
        let mut overlay = EyeflowConfig::default();
        overlay.node_id = "overlay-node".into();
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.node_id, "overlay-node");
    }

    #[test]
    fn merge_preserves_base_when_overlay_is_default() {
        let mut base = EyeflowConfig::default();
        base.node_id = "base-node".into();
        base.vault.addr = Some("https://vault:8200".into());
        let merged = merge_configs(base.clone(), EyeflowConfig::default());
        assert_eq!(merged.node_id, "base-node");
        assert_eq!(merged.vault.addr.as_deref(), Some("https://vault:8200"));
    }

    #[test]
    fn merge_kafka_brokers_replaced_not_concatenated() {
        let mut base = EyeflowConfig::default();
        base.kafka.brokers = vec!["old:9092".into()];
        let mut overlay = EyeflowConfig::default();
        overlay.kafka.brokers = vec!["new:9092".into()];
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.kafka.brokers, vec!["new:9092".to_string()]);
    }

    #[test]
    fn toml_roundtrip() {
        let mut cfg = EyeflowConfig::default();
        cfg.node_id = "roundtrip-node".into();
        cfg.kafka.enabled = true;
        cfg.kafka.brokers = vec!["b1:9092".into()];
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: EyeflowConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eyeflow.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "node_id = \"file-node\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.node_id, "file-node");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/eyeflow.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.node_id, "eyeflow-node-1");
    }

    #[test]
    fn config_error_display() {
        let e = ConfigError::FileNotFound { path: "/foo".into() };
        assert!(e.to_string().contains("/foo"));
        let e = ConfigError::ParseError { reason: "bad toml".into() };
        assert!(e.to_string().contains("bad toml"));
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::MissingOptionalField {
            field: "f".into(),
            hint: "h".into(),
        };
        assert!(w.to_string().contains('f'));
        let w = ConfigWarning::LargeScratchBuffer { bytes: 999 };
        assert!(w.to_string().contains("999"));
        let w = ConfigWarning::LongRetryInterval { secs: 999 };
        assert!(w.to_string().contains("999"));
    }
}
