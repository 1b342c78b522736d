// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::SecurityOption;

/// Complete daemon configuration, merged from config files and overridden
/// by command-line flags.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// TLS material and policy.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Listener settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Tree storage and persistence cadence.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Authentication knobs outside TLS.
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SecurityConfig {
    #[serde(default, rename = "key-file")]
    /// PEM private key for the server certificate.
    pub key_file: Option<PathBuf>,

    #[serde(default, rename = "certificate-file")]
    /// PEM server certificate.
    pub certificate_file: Option<PathBuf>,

    #[serde(default, rename = "certificate-chain-file")]
    /// Full PEM chain; overrides `certificate-file` when both are given.
    pub certificate_chain_file: Option<PathBuf>,

    #[serde(default, rename = "ca-list-file")]
    /// CA certificates used to validate client certificates.
    pub ca_list_file: Option<PathBuf>,

    #[serde(default = "default_security_option", rename = "security-policy")]
    pub security_policy: SecurityOption,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_port", rename = "port")]
    pub port: u16,

    #[serde(default = "default_keepalive_secs", rename = "keepalive-interval", with = "serde_secs")]
    /// Whitespace ping cadence on idle connections.
    pub keepalive_interval: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_root_directory", rename = "root-directory")]
    /// Root of the persisted tree.
    pub root_directory: PathBuf,

    #[serde(default, rename = "autosave-interval", with = "serde_opt_secs")]
    /// Seconds between autosaves of modified documents; absent disables.
    pub autosave_interval: Option<Duration>,

    #[serde(default, rename = "autosave-hook")]
    /// Command run after every autosave sweep.
    pub autosave_hook: Option<PathBuf>,

    #[serde(default, rename = "sync-directory")]
    /// Secondary directory receiving plain-text copies of live documents.
    pub sync_directory: Option<PathBuf>,

    #[serde(default, rename = "sync-interval", with = "serde_opt_secs")]
    pub sync_interval: Option<Duration>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct AuthConfig {
    #[serde(default, rename = "password")]
    /// Shared server password; when set, SASL PLAIN with any account id
    /// must present it.
    pub password: Option<String>,

    #[serde(default, rename = "pam-service")]
    /// PAM service name; accepted for compatibility, authentication then
    /// falls back to the account list in this build.
    pub pam_service: Option<String>,
}

fn default_port() -> u16 {
    6523
}

fn default_security_option() -> SecurityOption {
    SecurityOption::AllowTls
}

fn default_keepalive_secs() -> Duration {
    Duration::from_secs(30)
}

fn default_root_directory() -> PathBuf {
    PathBuf::from("/var/lib/infinoted")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            keepalive_interval: default_keepalive_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_directory: default_root_directory(),
            autosave_interval: None,
            autosave_hook: None,
            sync_directory: None,
            sync_interval: None,
        }
    }
}

impl Config {
    /// Loads and validates a single YAML config file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Loads the configuration search path: the user config first, then the
    /// system config; later files override earlier ones. Missing files are
    /// skipped.
    pub fn load_search_path() -> Result<Self> {
        let mut merged = Config::default();
        for path in Self::search_paths() {
            if !path.is_file() {
                continue;
            }
            let layer = Self::load_from_file(&path)?;
            merged = layer;
        }
        merged.validate_and_normalize()?;
        Ok(merged)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(home) = std::env::var_os("HOME") {
            out.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("infinoted.yaml"),
            );
        }
        out.push(PathBuf::from("/etc/infinoted.yaml"));
        out
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.network.port != 0, "port must not be zero");

        // TLS policies other than no-tls need key material.
        if self.security.security_policy != SecurityOption::NoTls {
            ensure!(
                self.security.key_file.is_some(),
                "security policy {} requires a key file",
                self.security.security_policy
            );
            ensure!(
                self.security.certificate_file.is_some()
                    || self.security.certificate_chain_file.is_some(),
                "security policy {} requires a certificate (or chain) file",
                self.security.security_policy
            );
        }

        if self.storage.sync_directory.is_some() {
            ensure!(
                self.storage.sync_interval.is_some(),
                "sync-directory requires sync-interval"
            );
        }
        if let Some(interval) = self.storage.autosave_interval {
            ensure!(
                !interval.is_zero(),
                "autosave-interval must be positive"
            );
        }
        Ok(())
    }

    /// The PEM file holding the certificate chain to serve.
    pub fn certificate_source(&self) -> Option<&PathBuf> {
        self.security
            .certificate_chain_file
            .as_ref()
            .or(self.security.certificate_file.as_ref())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod serde_opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.network.port, 6523);
        assert_eq!(cfg.security.security_policy, SecurityOption::AllowTls);
    }

    #[test]
    fn test_tls_policy_requires_material() {
        let mut cfg = Config::default();
        cfg.security.security_policy = SecurityOption::RequireTls;
        assert!(cfg.validate_and_normalize().is_err());

        cfg.security.key_file = Some(PathBuf::from("key.pem"));
        cfg.security.certificate_file = Some(PathBuf::from("cert.pem"));
        assert!(cfg.validate_and_normalize().is_ok());

        cfg.security.security_policy = SecurityOption::NoTls;
        cfg.security.key_file = None;
        cfg.security.certificate_file = None;
        assert!(cfg.validate_and_normalize().is_ok());
    }

    #[test]
    fn test_yaml_parse() -> Result<()> {
        let yaml = r#"
security:
  security-policy: no-tls
network:
  port: 7000
storage:
  root-directory: /tmp/infinoted-test
  autosave-interval: 60
auth: {}
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml)?;
        cfg.validate_and_normalize()?;
        assert_eq!(cfg.network.port, 7000);
        assert_eq!(
            cfg.storage.autosave_interval,
            Some(Duration::from_secs(60))
        );
        Ok(())
    }

    #[test]
    fn test_sync_directory_requires_interval() {
        let mut cfg = Config::default();
        cfg.security.security_policy = SecurityOption::NoTls;
        cfg.storage.sync_directory = Some(PathBuf::from("/tmp/sync"));
        assert!(cfg.validate_and_normalize().is_err());
        cfg.storage.sync_interval = Some(Duration::from_secs(10));
        assert!(cfg.validate_and_normalize().is_ok());
    }
}
