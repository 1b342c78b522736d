// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use infinote_rs::{
    acl::{AccountStore, AclMask, AclSheet, SheetSet},
    cfg::{
        cli::Options,
        enums::SecurityOption,
        logger::{init_default_logger, init_logger},
    },
    comm::registry::CommunicationManager,
    directory::{server::ServerDirectory, storage::FilesystemStorage},
    error::SaslCondition,
    transport::{
        Connection,
        sasl::{MECHANISM_ANONYMOUS, MECHANISM_PLAIN, SaslServerBackend, parse_plain_response},
        tls::server_config,
        xmpp::{XmppConnection, XmppServerConfig, server_negotiate},
    },
};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// SASL backend honouring `--password`: with a server password set, any
/// account id authenticates with that shared secret; otherwise the account
/// list decides.
struct DaemonSasl {
    accounts: Arc<AccountStore>,
    server_password: Option<String>,
}

impl SaslServerBackend for DaemonSasl {
    fn mechanisms(&self) -> Vec<&'static str> {
        vec![MECHANISM_PLAIN, MECHANISM_ANONYMOUS]
    }

    fn authenticate(
        &self,
        mechanism: &str,
        initial_response: &[u8],
    ) -> Result<String, SaslCondition> {
        if mechanism == MECHANISM_PLAIN
            && let Some(server_password) = &self.server_password
        {
            let (_, username, password) = parse_plain_response(initial_response)?;
            if password == *server_password {
                return Ok(if username.is_empty() {
                    "default".to_string()
                } else {
                    username
                });
            }
            return Err(SaslCondition::NotAuthorized);
        }
        self.accounts.authenticate(mechanism, initial_response)
    }
}

/// Generates missing key/certificate material for --create-key and
/// --create-certificate.
fn create_credentials(options: &Options) -> Result<()> {
    let Some(key_path) = &options.key_file else {
        if options.create_key || options.create_certificate {
            bail!("--create-key/--create-certificate require --key-file");
        }
        return Ok(());
    };

    let key_pair = if options.create_key && !key_path.exists() {
        let key_pair = rcgen::KeyPair::generate()
            .context("failed to generate a private key")?;
        std::fs::write(key_path, key_pair.serialize_pem())
            .with_context(|| format!("failed to write {key_path:?}"))?;
        info!(?key_path, "generated private key");
        Some(key_pair)
    } else {
        None
    };

    if options.create_certificate {
        let cert_path = options
            .certificate_file
            .as_ref()
            .or(options.certificate_chain_file.as_ref())
            .context("--create-certificate requires --certificate-file")?;
        if !cert_path.exists() {
            let key_pair = match key_pair {
                Some(kp) => kp,
                None => {
                    let pem = std::fs::read_to_string(key_path)
                        .with_context(|| format!("failed to read {key_path:?}"))?;
                    rcgen::KeyPair::from_pem(&pem)
                        .context("failed to parse the private key")?
                },
            };
            let hostname = hostname_for_certificate();
            let params = rcgen::CertificateParams::new(vec![hostname.clone()])
                .context("failed to build certificate parameters")?;
            let cert = params
                .self_signed(&key_pair)
                .context("failed to self-sign the certificate")?;
            std::fs::write(cert_path, cert.pem())
                .with_context(|| format!("failed to write {cert_path:?}"))?;
            info!(?cert_path, hostname, "generated self-signed certificate");
        }
    }
    Ok(())
}

fn hostname_for_certificate() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Grants the `default` account the everyday permissions when the server
/// starts with an empty ACL, so a fresh tree is usable at all.
fn seed_default_acl(directory: &Arc<ServerDirectory>) -> Result<()> {
    let root_sheets = directory.query_acl(0).context("failed to query root ACL")?;
    if !root_sheets.is_empty() {
        return Ok(());
    }

    let everyday = AclMask::CAN_ADD_SUBDIRECTORY
        | AclMask::CAN_ADD_DOCUMENT
        | AclMask::CAN_SYNC_IN
        | AclMask::CAN_REMOVE_NODE
        | AclMask::CAN_EXPLORE_NODE
        | AclMask::CAN_SUBSCRIBE_SESSION
        | AclMask::CAN_JOIN_USER
        | AclMask::CAN_QUERY_ACL;
    let mut sheets = SheetSet::new();
    sheets.set("default", AclSheet::new(AclMask::all(), everyday));
    directory
        .set_acl(0, sheets)
        .context("failed to seed the default ACL")?;
    Ok(())
}

async fn run_autosave_hook(hook: &Path) {
    match tokio::process::Command::new(hook).status().await {
        Ok(status) if status.success() => {},
        Ok(status) => warn!(?hook, %status, "autosave hook failed"),
        Err(e) => warn!(?hook, "autosave hook did not run: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    let _log_guard = match &options.log_config {
        Some(path) => init_logger(path)?,
        None => init_default_logger("info")?,
    };

    create_credentials(&options)?;
    let create_key = options.create_key;
    let cfg = options.into_config()?;
    if create_key {
        info!("credential material ready");
    }

    // TLS setup per policy.
    let tls = if cfg.security.security_policy == SecurityOption::NoTls {
        None
    } else {
        let key_path = cfg
            .security
            .key_file
            .as_ref()
            .context("a key file is required for TLS")?;
        let cert_path = cfg
            .certificate_source()
            .context("a certificate file is required for TLS")?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read {key_path:?}"))?;
        let chain_pem = std::fs::read(cert_path)
            .with_context(|| format!("failed to read {cert_path:?}"))?;
        Some(Arc::new(server_config(&key_pem, &chain_pem)?))
    };

    if let Some(service) = &cfg.auth.pam_service {
        warn!(service, "pam-service is accepted but not used by this build");
    }

    // Engine state.
    let storage = Arc::new(
        FilesystemStorage::new(&cfg.storage.root_directory)
            .context("failed to open the root directory")?,
    );
    let accounts = Arc::new(
        AccountStore::open(cfg.storage.root_directory.join("accounts.xml"))
            .context("failed to open the account list")?,
    );
    let manager = Arc::new(CommunicationManager::new());
    let directory = ServerDirectory::new(storage, Arc::clone(&accounts), manager)
        .context("failed to build the directory")?;
    seed_default_acl(&directory)?;

    let sasl: Arc<dyn SaslServerBackend> = Arc::new(DaemonSasl {
        accounts,
        server_password: cfg.auth.password.clone(),
    });
    let xmpp_cfg = Arc::new(XmppServerConfig {
        local_hostname: hostname_for_certificate(),
        policy: cfg.security.security_policy.to_policy(),
        tls,
        backend: sasl,
    });

    // Periodic work: autosave, plain-text sync, request-log pruning.
    if let Some(interval) = cfg.storage.autosave_interval {
        let directory = Arc::clone(&directory);
        let hook = cfg.storage.autosave_hook.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let saved = directory.save_dirty_sessions();
                if saved > 0 {
                    info!(saved, "autosave");
                    if let Some(hook) = &hook {
                        run_autosave_hook(hook).await;
                    }
                }
            }
        });
    }

    if let (Some(sync_dir), Some(interval)) = (
        cfg.storage.sync_directory.clone(),
        cfg.storage.sync_interval,
    ) {
        let directory = Arc::clone(&directory);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let written = directory.write_plain_copies(&sync_dir);
                if written > 0 {
                    info!(written, "directory sync");
                }
            }
        });
    }

    {
        let directory = Arc::clone(&directory);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                directory.cleanup_sessions();
            }
        });
    }

    // Accept loop.
    let listener = TcpListener::bind(("0.0.0.0", cfg.network.port))
        .await
        .with_context(|| format!("failed to bind port {}", cfg.network.port))?;
    info!(port = cfg.network.port, "infinoted listening");

    let keepalive = cfg.network.keepalive_interval;
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("accept failed")?,
            _ = tokio::signal::ctrl_c() => break,
        };

        let directory = Arc::clone(&directory);
        let xmpp_cfg = Arc::clone(&xmpp_cfg);
        tokio::spawn(async move {
            match server_negotiate(stream, &xmpp_cfg).await {
                Ok(negotiated) => {
                    let conn = XmppConnection::spawn(
                        negotiated,
                        xmpp_cfg.local_hostname.clone(),
                        peer.to_string(),
                    );
                    let as_conn: Arc<dyn Connection> = conn.clone();
                    directory.add_connection(Arc::clone(&as_conn));
                    conn.start();

                    let mut ticker = tokio::time::interval(keepalive);
                    loop {
                        ticker.tick().await;
                        if as_conn.status()
                            == infinote_rs::transport::ConnectionStatus::Closed
                        {
                            break;
                        }
                        conn.send_keepalive();
                    }
                },
                Err(e) => {
                    warn!(%peer, "negotiation failed: {e}");
                },
            }
        });
    }

    info!("shutting down, saving modified documents");
    let saved = directory.save_dirty_sessions();
    info!(saved, "shutdown save complete");
    Ok(())
}
