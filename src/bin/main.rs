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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wallet_ledger::config::LoggingConfig;
use wallet_ledger::{
    CacheBackend, EntryRequest, LedgerCache, LedgerConfig, LedgerError, MemoryCache, MemoryStore,
    OwnerId, TransferCoordinator, TransferRequest, WalletId,
};

/// Wallet Ledger - Replay ledger command CSV files
///
/// Reads wallet commands from a CSV file and outputs wallet balances to stdout.
/// Supports opening wallets, credits, debits, and transfers.
#[derive(Parser, Debug)]
#[command(name = "wallet-ledger")]
#[command(about = "Replays wallet ledger commands from a CSV file", long_about = None)]
struct Args {
    /// Path to CSV file with ledger commands
    ///
    /// Expected format: op,owner,counterparty,amount,key
    /// Example: cargo run -- commands.csv > wallets.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `wallet_ledger=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match LedgerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => LedgerConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    init_logging(&config.logging);

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let ledger = match replay_commands(BufReader::new(file), config) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("Error processing commands: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_wallets(&ledger, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Logs go to stderr so stdout carries only the CSV report.
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.json {
        builder.json().with_target(true).init();
    } else {
        builder.with_target(false).init();
    }
}

#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, owner, counterparty, amount, key`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    owner: String,
    #[serde(default)]
    counterparty: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

/// Replays ledger commands from a CSV reader.
///
/// Rows are applied in order. Malformed rows and rejected commands are logged
/// and skipped; only a failing reader or store aborts the replay.
///
/// # CSV Format
///
/// Expected columns: `op, owner, counterparty, amount, key`
/// - `op`: `open`, `credit`, `debit`, or `transfer`
/// - `owner`: Owner of the wallet acted on (the source of a transfer)
/// - `counterparty`: Destination owner of a transfer
/// - `amount`: Decimal amount (initial balance for `open`)
/// - `key`: Idempotency key (required for `transfer`)
///
/// # Example
///
/// ```csv
/// op,owner,counterparty,amount,key
/// open,alice,,100.00,
/// open,bob,,,
/// transfer,alice,bob,25.00,t-1
/// debit,bob,,5.00,d-1
/// ```
fn replay_commands<R: Read>(
    reader: R,
    config: LedgerConfig,
) -> Result<TransferCoordinator<MemoryStore>, ReplayError> {
    let cache = LedgerCache::new(
        Arc::new(MemoryCache::new()) as Arc<dyn CacheBackend>,
        &config.cache,
    );
    let ledger = TransferCoordinator::with_cache(Arc::new(MemoryStore::new()), cache, config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (row, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(row, error = %e, "skipping malformed row");
                continue;
            }
        };
        match apply_record(&ledger, record) {
            Ok(()) => {}
            Err(LedgerError::Store(e)) => return Err(LedgerError::Store(e).into()),
            Err(e) => warn!(row, error = %e, kind = ?e.kind(), "skipping rejected command"),
        }
    }

    info!(wallets = ledger.wallets()?.len(), "replay finished");
    Ok(ledger)
}

fn apply_record(
    ledger: &TransferCoordinator<MemoryStore>,
    record: CsvRecord,
) -> Result<(), LedgerError> {
    let amount = record.amount.filter(|a| !a.is_empty());
    let key = record.key.filter(|k| !k.is_empty());

    match record.op.to_lowercase().as_str() {
        "open" => {
            ledger.create_wallet(OwnerId::new(record.owner), amount.as_deref())?;
        }
        "credit" | "debit" => {
            let wallet_id = wallet_of(ledger, &record.owner)?;
            let mut request = EntryRequest::new(wallet_id, amount.unwrap_or_default());
            request.idempotency_key = key;
            if record.op.eq_ignore_ascii_case("credit") {
                ledger.credit(request)?;
            } else {
                ledger.debit(request)?;
            }
        }
        "transfer" => {
            let from = wallet_of(ledger, &record.owner)?;
            let to = wallet_of(ledger, record.counterparty.as_deref().unwrap_or_default())?;
            ledger.transfer(TransferRequest::new(
                from,
                to,
                amount.unwrap_or_default(),
                key.unwrap_or_default(),
            ))?;
        }
        other => debug!(op = other, "skipping unknown operation"),
    }
    Ok(())
}

fn wallet_of(
    ledger: &TransferCoordinator<MemoryStore>,
    owner: &str,
) -> Result<WalletId, LedgerError> {
    Ok(ledger.get_wallet_by_owner(&OwnerId::new(owner))?.wallet.id)
}

/// One output row per wallet.
#[derive(Debug, Serialize)]
struct WalletRecord {
    wallet: String,
    owner: String,
    balance: String,
}

/// Writes wallet states to a CSV writer.
///
/// # CSV Format
///
/// Columns: `wallet, owner, balance`
///
/// ```csv
/// wallet,owner,balance
/// 0b8e6c1e-7d1f-4a2b-9a57-3c1d2e4f5a6b,alice,75.00
/// ```
fn write_wallets<W: Write>(
    ledger: &TransferCoordinator<MemoryStore>,
    writer: W,
) -> Result<(), ReplayError> {
    let mut wtr = Writer::from_writer(writer);

    for wallet in ledger.wallets()? {
        wtr.serialize(WalletRecord {
            wallet: wallet.id.to_string(),
            owner: wallet.owner_id.to_string(),
            balance: wallet.balance.to_string(),
        })?;
    }

    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use wallet_ledger::Amount;

    fn replay(csv: &str) -> TransferCoordinator<MemoryStore> {
        replay_commands(Cursor::new(csv.to_string()), LedgerConfig::default()).unwrap()
    }

    fn balance_of(ledger: &TransferCoordinator<MemoryStore>, owner: &str) -> Amount {
        ledger
            .get_wallet_by_owner(&OwnerId::new(owner))
            .unwrap()
            .wallet
            .balance
    }

    fn amt(raw: &str) -> Amount {
        Amount::parse(raw).unwrap()
    }

    #[test]
    fn parse_open_and_credit() {
        let csv = "op,owner,counterparty,amount,key\n\
                   open,alice,,100.00,\n\
                   credit,alice,,0.5,\n";

        let ledger = replay(csv);

        assert_eq!(ledger.wallets().unwrap().len(), 1);
        assert_eq!(balance_of(&ledger, "alice"), amt("100.50"));
    }

    #[test]
    fn parse_transfer() {
        let csv = "op,owner,counterparty,amount,key\n\
                   open,alice,,100.00,\n\
                   open,bob,,,\n\
                   transfer,alice,bob,25.00,t-1\n";

        let ledger = replay(csv);

        assert_eq!(balance_of(&ledger, "alice"), amt("75.00"));
        assert_eq!(balance_of(&ledger, "bob"), amt("25.00"));
    }

    #[test]
    fn duplicate_keys_apply_once() {
        let csv = "op,owner,counterparty,amount,key\n\
                   open,alice,,10.00,\n\
                   credit,alice,,5.00,c-1\n\
                   credit,alice,,5.00,c-1\n\
                   credit,alice,,5.00,\n\
                   credit,alice,,5.00,\n";

        let ledger = replay(csv);

        assert_eq!(balance_of(&ledger, "alice"), amt("25.00"));
    }

    #[test]
    fn rejected_commands_are_skipped() {
        let csv = "op,owner,counterparty,amount,key\n\
                   open,alice,,10.00,\n\
                   debit,alice,,50.00,\n\
                   transfer,alice,alice,1.00,t-1\n\
                   transfer,alice,nobody,1.00,t-2\n\
                   credit,alice,,-3,\n\
                   open,alice,,,\n\
                   debit,alice,,4.00,\n";

        let ledger = replay(csv);

        assert_eq!(ledger.wallets().unwrap().len(), 1);
        assert_eq!(balance_of(&ledger, "alice"), amt("6.00"));
    }

    #[test]
    fn parse_with_whitespace() {
        let csv = "op,owner,counterparty,amount,key\n open , alice , , 12.5 , \n";

        let ledger = replay(csv);

        assert_eq!(balance_of(&ledger, "alice"), amt("12.50"));
    }

    #[test]
    fn skip_unknown_operations() {
        let csv = "op,owner,counterparty,amount,key\n\
                   open,alice,,1.00,\n\
                   dispute,alice,,1.00,\n\
                   open,bob,,2.00,\n";

        let ledger = replay(csv);

        assert_eq!(ledger.wallets().unwrap().len(), 2);
    }

    #[test]
    fn write_wallets_to_csv() {
        let csv = "op,owner,counterparty,amount,key\n\
                   open,alice,,100.5,\n\
                   open,bob,,200.25,\n";
        let ledger = replay(csv);

        let mut output = Vec::new();
        write_wallets(&ledger, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("wallet,owner,balance"));
        assert!(output.contains(",alice,100.50"));
        assert!(output.contains(",bob,200.25"));
    }
}
