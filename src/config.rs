//! Configuration loading via `ortho-config`.
//!
//! [`FleetConfig`] merges defaults, `flotilla.toml`, and `FLOTILLA_*`
//! environment variables. CLI flags override the merged values per
//! invocation.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::batch::BatchOptions;
use crate::connection::SshDefaults;
use crate::policy::FailurePolicy;
use crate::report::OutputMode;
use crate::transport::SshSettings;

/// Dispatcher and SSH settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLOTILLA",
    discovery(
        app_name = "flotilla",
        env_var = "FLOTILLA_CONFIG_PATH",
        config_file_name = "flotilla.toml",
        dotfile_name = ".flotilla.toml",
        project_file_name = "flotilla.toml"
    )
)]
pub struct FleetConfig {
    /// Maximum number of targets contacted concurrently.
    #[ortho_config(default = 5)]
    pub max_workers: usize,
    /// Per-target timeout in seconds.
    #[ortho_config(default = 60)]
    pub timeout_secs: u64,
    /// Output layout: `prefixed` or `grouped`.
    #[ortho_config(default = "prefixed".to_owned())]
    pub output_mode: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user used when a target names none.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Port used when a target names none.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Whether to force batch mode for SSH to avoid password prompts. Unset
    /// means enabled.
    pub ssh_batch_mode: Option<bool>,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key passed to `ssh -i`. Supports tilde expansion. When unset
    /// the client falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// TCP connect timeout handed to the client, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// JSON inventory file consulted when `--inventory` is not given.
    pub inventory_file: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn error(&self, problem: &str) -> ConfigError {
        ConfigError::InvalidField(format!(
            "{} {problem}: set {} or add {} to flotilla.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl FleetConfig {
    fn require_text(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.error("must not be empty"));
        }
        Ok(())
    }

    fn require_optional_text(
        value: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        value.map_or(Ok(()), |text| Self::require_text(text, metadata))
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.error("must be greater than zero"));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("flotilla")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for blank binaries or users,
    /// zero worker bounds or timeouts, and unknown output modes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(
                FieldMetadata::new("worker bound", "FLOTILLA_MAX_WORKERS", "max_workers")
                    .error("must be greater than zero"),
            );
        }
        Self::require_positive(
            self.timeout_secs,
            &FieldMetadata::new("per-target timeout", "FLOTILLA_TIMEOUT_SECS", "timeout_secs"),
        )?;
        self.output_mode()?;
        Self::require_text(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "FLOTILLA_SSH_BIN", "ssh_bin"),
        )?;
        Self::require_text(
            &self.scp_bin,
            &FieldMetadata::new("scp binary", "FLOTILLA_SCP_BIN", "scp_bin"),
        )?;
        Self::require_text(
            &self.ssh_user,
            &FieldMetadata::new("default SSH user", "FLOTILLA_SSH_USER", "ssh_user"),
        )?;
        Self::require_optional_text(
            self.ssh_identity_file.as_deref(),
            &FieldMetadata::new(
                "SSH identity file",
                "FLOTILLA_SSH_IDENTITY_FILE",
                "ssh_identity_file",
            ),
        )?;
        Self::require_optional_text(
            self.inventory_file.as_deref(),
            &FieldMetadata::new("inventory file", "FLOTILLA_INVENTORY_FILE", "inventory_file"),
        )?;
        Ok(())
    }

    /// Parses the configured output mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for unknown modes.
    pub fn output_mode(&self) -> Result<OutputMode, ConfigError> {
        self.output_mode.parse().map_err(|_| {
            FieldMetadata::new(
                "output mode ('prefixed' or 'grouped')",
                "FLOTILLA_OUTPUT_MODE",
                "output_mode",
            )
            .error(&format!("'{}' is not recognised", self.output_mode))
        })
    }

    /// Builds batch options from the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn batch_options(&self) -> Result<BatchOptions, ConfigError> {
        self.validate()?;
        Ok(BatchOptions {
            max_workers: self.max_workers,
            timeout: Duration::from_secs(self.timeout_secs),
            dry_run: false,
            output_mode: self.output_mode()?,
            failure_policy: FailurePolicy::default(),
        })
    }

    /// Returns the client settings shared by every session.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            batch_mode: self.ssh_batch_mode.unwrap_or(true),
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    /// Returns the defaults merged into every target's connection reference.
    #[must_use]
    pub fn ssh_defaults(&self) -> SshDefaults {
        SshDefaults {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.ssh_identity_file.clone(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a configuration field holds an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
