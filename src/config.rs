// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ledger configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! pending_log = "write_ahead"
//!
//! [cache]
//! enabled = true
//! balance_ttl_secs = 60
//! idempotency_ttl_secs = 86400
//! transfer_ttl_secs = 3600
//!
//! [history]
//! default_limit = 50
//! max_limit = 1000
//! recent_entries = 10
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub pending_log: PendingLogMode,
    pub cache: CacheConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

impl LedgerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// Where the PENDING transaction log is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingLogMode {
    /// Commit the PENDING log in its own unit before touching balances.
    ///
    /// The log survives a crash mid-operation; a crash between the two units
    /// leaves a PENDING log with no entries, which
    /// `TransferCoordinator::reconcile_stale_pending` later fails. Business
    /// failures are recorded as FAILED and poison the key.
    #[default]
    WriteAhead,
    /// Insert the PENDING log in the same unit as the balance change.
    ///
    /// Any failure rolls the log back with everything else, so nothing about a
    /// failed attempt persists and its key may be reused.
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Upper bound on how long a balance read that raced a write can stay
    /// cached. Writes bump a per-wallet version and invalidate; a read only
    /// populates the cache if no write committed while it ran, but a write
    /// landing between that check and the cache write is only cleared by expiry.
    pub balance_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub transfer_ttl_secs: u64,
}

impl CacheConfig {
    pub fn balance_ttl(&self) -> Duration {
        Duration::from_secs(self.balance_ttl_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn transfer_ttl(&self) -> Duration {
        Duration::from_secs(self.transfer_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            balance_ttl_secs: 60,
            idempotency_ttl_secs: 24 * 60 * 60,
            transfer_ttl_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Entries included with a wallet lookup.
    pub recent_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 1000,
            recent_entries: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = LedgerConfig::from_toml_str("").unwrap();
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.pending_log, PendingLogMode::WriteAhead);
        assert_eq!(config.cache.balance_ttl(), Duration::from_secs(60));
        assert_eq!(config.history.default_limit, 50);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = LedgerConfig::from_toml_str(
            r#"
            pending_log = "inline"

            [cache]
            enabled = false

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.pending_log, PendingLogMode::Inline);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.transfer_ttl_secs, 3600);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let result = LedgerConfig::from_toml_str("pending_log = \"eventually\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
