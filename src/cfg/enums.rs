// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::transport::xmpp::SecurityPolicy;

/// The daemon's `--security-policy` values.
#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum,
)]
pub enum SecurityOption {
    #[serde(rename = "no-tls", alias = "no_tls", alias = "NoTls")]
    #[value(name = "no-tls")]
    NoTls,
    #[serde(rename = "allow-tls", alias = "allow_tls", alias = "AllowTls")]
    #[value(name = "allow-tls")]
    #[default]
    AllowTls,
    #[serde(rename = "require-tls", alias = "require_tls", alias = "RequireTls")]
    #[value(name = "require-tls")]
    RequireTls,
}

impl SecurityOption {
    /// Maps the daemon option onto the transport negotiation policy.
    pub fn to_policy(self) -> SecurityPolicy {
        match self {
            SecurityOption::NoTls => SecurityPolicy::OnlyUnsecured,
            SecurityOption::AllowTls => SecurityPolicy::BothPreferTls,
            SecurityOption::RequireTls => SecurityPolicy::OnlyTls,
        }
    }
}

impl fmt::Display for SecurityOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityOption::NoTls => "no-tls",
            SecurityOption::AllowTls => "allow-tls",
            SecurityOption::RequireTls => "require-tls",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_mapping() {
        assert_eq!(
            SecurityOption::NoTls.to_policy(),
            SecurityPolicy::OnlyUnsecured
        );
        assert_eq!(
            SecurityOption::AllowTls.to_policy(),
            SecurityPolicy::BothPreferTls
        );
        assert_eq!(
            SecurityOption::RequireTls.to_policy(),
            SecurityPolicy::OnlyTls
        );
    }
}
