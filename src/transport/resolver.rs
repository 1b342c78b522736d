// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use hickory_resolver::{TokioResolver, proto::rr::rdata::SRV};
use tracing::debug;

/// One resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// Resolves `_infinote._tcp.<host>` SRV records into a priority/weight
/// ordered target list, falling back to the host itself when the lookup
/// yields nothing.
pub async fn resolve_targets(host: &str, port: u16) -> Result<Vec<Target>> {
    let resolver = TokioResolver::builder_tokio()
        .context("failed to read system resolver configuration")?
        .build();

    let name = format!("_infinote._tcp.{host}.");
    match resolver.srv_lookup(name.clone()).await {
        Ok(lookup) => {
            let mut records: Vec<&SRV> = lookup.iter().collect();
            if records.is_empty() {
                debug!(host, "empty SRV answer, using direct target");
                return Ok(vec![direct(host, port)]);
            }
            // Lower priority first; heavier weight first within a priority.
            records.sort_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(b.weight().cmp(&a.weight()))
            });
            Ok(records
                .iter()
                .map(|srv| Target {
                    host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                    port: srv.port(),
                })
                .collect())
        },
        Err(err) => {
            debug!(host, %err, "SRV lookup failed, using direct target");
            Ok(vec![direct(host, port)])
        },
    }
}

fn direct(host: &str, port: u16) -> Target {
    Target {
        host: host.to_string(),
        port,
    }
}
