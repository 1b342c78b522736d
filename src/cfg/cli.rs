// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::cfg::{config::Config, enums::SecurityOption};

/// The infinote collaborative editing daemon.
#[derive(Parser, Debug, Default)]
#[command(name = "infinoted", version, about)]
pub struct Options {
    /// Explicit configuration file; skips the default search path.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// PEM private key for the server certificate.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// PEM server certificate.
    #[arg(long)]
    pub certificate_file: Option<PathBuf>,

    /// Full PEM certificate chain (overrides --certificate-file).
    #[arg(long)]
    pub certificate_chain_file: Option<PathBuf>,

    /// CA certificates used to validate client certificates.
    #[arg(long)]
    pub ca_list_file: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Whether to offer or require TLS.
    #[arg(long)]
    pub security_policy: Option<SecurityOption>,

    /// Generate the private key if it does not exist yet.
    #[arg(long)]
    pub create_key: bool,

    /// Generate a self-signed certificate if it does not exist yet.
    #[arg(long)]
    pub create_certificate: bool,

    /// Shared server password required from every client.
    #[arg(long)]
    pub password: Option<String>,

    /// PAM service name (accepted for compatibility).
    #[arg(long)]
    pub pam_service: Option<String>,

    /// Root of the persisted document tree.
    #[arg(long)]
    pub root_directory: Option<PathBuf>,

    /// Seconds between autosaves of modified documents.
    #[arg(long)]
    pub autosave_interval: Option<u64>,

    /// Command to run after each autosave sweep.
    #[arg(long)]
    pub autosave_hook: Option<PathBuf>,

    /// Directory receiving plain-text copies of live documents.
    #[arg(long)]
    pub sync_directory: Option<PathBuf>,

    /// Seconds between plain-text sync sweeps.
    #[arg(long)]
    pub sync_interval: Option<u64>,

    /// Logger configuration file.
    #[arg(long)]
    pub log_config: Option<PathBuf>,
}

impl Options {
    /// Loads config files and lays the command line on top.
    pub fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config_file {
            Some(path) => Config::load_from_file(resolve_config_path(path)?)?,
            None => Config::load_search_path()?,
        };

        if let Some(v) = self.key_file {
            cfg.security.key_file = Some(v);
        }
        if let Some(v) = self.certificate_file {
            cfg.security.certificate_file = Some(v);
        }
        if let Some(v) = self.certificate_chain_file {
            cfg.security.certificate_chain_file = Some(v);
        }
        if let Some(v) = self.ca_list_file {
            cfg.security.ca_list_file = Some(v);
        }
        if let Some(v) = self.port {
            cfg.network.port = v;
        }
        if let Some(v) = self.security_policy {
            cfg.security.security_policy = v;
        }
        if let Some(v) = self.password {
            cfg.auth.password = Some(v);
        }
        if let Some(v) = self.pam_service {
            cfg.auth.pam_service = Some(v);
        }
        if let Some(v) = self.root_directory {
            cfg.storage.root_directory = v;
        }
        if let Some(v) = self.autosave_interval {
            cfg.storage.autosave_interval = Some(Duration::from_secs(v));
        }
        if let Some(v) = self.autosave_hook {
            cfg.storage.autosave_hook = Some(v);
        }
        if let Some(v) = self.sync_directory {
            cfg.storage.sync_directory = Some(v);
        }
        if let Some(v) = self.sync_interval {
            cfg.storage.sync_interval = Some(Duration::from_secs(v));
        }

        cfg.validate_and_normalize()?;
        Ok(cfg)
    }
}

/// Resolves a `--config-file` argument: relative paths are anchored at the
/// working directory, and the result is canonicalized so that error
/// messages and the search-path override log always name the real file.
pub fn resolve_config_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot determine the working directory")?
            .join(path)
    };
    absolute
        .canonicalize()
        .with_context(|| format!("config file {absolute:?} is not readable"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_config_path_canonicalizes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("conf"))?;
        let file = dir.path().join("conf").join("infinoted.yaml");
        std::fs::write(&file, "network:\n  port: 6524\n")?;

        // Dotted components collapse to the real file.
        let dotted = dir
            .path()
            .join("conf")
            .join("..")
            .join("conf")
            .join("infinoted.yaml");
        assert_eq!(resolve_config_path(&dotted)?, file.canonicalize()?);

        // A missing file is a startup error, not a silent fallback.
        assert!(resolve_config_path(&dir.path().join("missing.yaml")).is_err());
        Ok(())
    }

    #[test]
    fn test_cli_overrides_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cfg.yaml");
        std::fs::write(
            &path,
            "network:\n  port: 7000\nsecurity:\n  security-policy: no-tls\n",
        )?;

        let options = Options {
            config_file: Some(path),
            port: Some(8000),
            root_directory: Some(dir.path().to_path_buf()),
            ..Options::default()
        };
        let cfg = options.into_config()?;
        assert_eq!(cfg.network.port, 8000);
        assert_eq!(cfg.security.security_policy, SecurityOption::NoTls);
        Ok(())
    }
}
