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

//! In-process implementation of [`Store`].
//!
//! Each wallet row carries its own [`Mutex`] acting as the exclusive row lock,
//! held by a [`MemoryUnit`] from [`WalletRepository::lock_wallet`] until commit
//! or rollback. Unique indexes (owner, idempotency key) are claimed at write
//! time through the [`DashMap`] entry API, so two concurrent units can never
//! both insert the same key. Writes are buffered in the unit and published
//! under a single commit gate, which readers share, so a reader never observes
//! half of a commit.

use super::{
    IDEMPOTENCY_KEY_INDEX, LedgerRepository, Store, TransactionLogRepository, UnitOfWork,
    WALLET_OWNER_INDEX, WalletRepository,
};
use crate::base::{IdempotencyKey, OwnerId, TransactionLogId, WalletId};
use crate::error::StoreError;
use crate::model::{History, LedgerEntry, TransactionLog, TransactionStatus, Wallet};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

#[derive(Debug)]
struct WalletRow {
    lock: Arc<Mutex<()>>,
    committed: RwLock<Wallet>,
}

impl WalletRow {
    fn new(wallet: Wallet) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            committed: RwLock::new(wallet),
        }
    }
}

/// Ledger rows in commit order plus their secondary indexes.
#[derive(Debug, Default)]
struct LedgerTable {
    rows: Vec<LedgerEntry>,
    by_wallet: HashMap<WalletId, Vec<usize>>,
    by_log: HashMap<TransactionLogId, Vec<usize>>,
    by_reference: HashMap<String, Vec<usize>>,
}

impl LedgerTable {
    fn append(&mut self, entry: LedgerEntry) {
        let index = self.rows.len();
        self.by_wallet.entry(entry.wallet_id).or_default().push(index);
        if let Some(log_id) = entry.transaction_log_id {
            self.by_log.entry(log_id).or_default().push(index);
        }
        if let Some(reference) = &entry.reference {
            self.by_reference
                .entry(reference.clone())
                .or_default()
                .push(index);
        }
        self.rows.push(entry);
    }

    fn rows_at(&self, indexes: Option<&Vec<usize>>) -> Vec<LedgerEntry> {
        indexes
            .map(|indexes| indexes.iter().map(|&i| self.rows[i].clone()).collect())
            .unwrap_or_default()
    }
}

/// Thread-safe in-memory ledger storage.
#[derive(Debug)]
pub struct MemoryStore {
    wallets: DashMap<WalletId, Arc<WalletRow>>,
    /// Unique owner index. Claimed on insert, before the wallet row commits.
    owners: DashMap<OwnerId, WalletId>,
    ledger: RwLock<LedgerTable>,
    logs: DashMap<TransactionLogId, TransactionLog>,
    /// Unique idempotency key index. Claimed on insert, before the log commits.
    keys: DashMap<IdempotencyKey, TransactionLogId>,
    commit_gate: RwLock<()>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            wallets: DashMap::new(),
            owners: DashMap::new(),
            ledger: RwLock::new(LedgerTable::default()),
            logs: DashMap::new(),
            keys: DashMap::new(),
            commit_gate: RwLock::new(()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the connection to the storage engine.
    ///
    /// While unavailable every read, write, and commit fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection lost".to_string()))
        }
    }

    fn committed_wallet(&self, id: &WalletId) -> Option<Wallet> {
        self.wallets.get(id).map(|row| row.committed.read().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Unit<'a> = MemoryUnit<'a>;

    fn begin(&self) -> Result<MemoryUnit<'_>, StoreError> {
        self.check_available()?;
        Ok(MemoryUnit::new(self))
    }

    fn find_wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        Ok(self.committed_wallet(&id))
    }

    fn find_wallet_by_owner(&self, owner_id: &OwnerId) -> Result<Option<Wallet>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        let Some(id) = self.owners.get(owner_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.committed_wallet(&id))
    }

    fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        let mut wallets: Vec<Wallet> = self
            .wallets
            .iter()
            .map(|row| row.committed.read().clone())
            .collect();
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(wallets)
    }

    fn find_log_by_key(&self, key: &IdempotencyKey) -> Result<Option<TransactionLog>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        let Some(id) = self.keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        // A reserved key whose log has not committed yet is invisible here.
        Ok(self.logs.get(&id).map(|log| log.clone()))
    }

    fn entries_for_log(&self, id: TransactionLogId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        let ledger = self.ledger.read();
        Ok(ledger.rows_at(ledger.by_log.get(&id)))
    }

    fn wallet_history(
        &self,
        id: WalletId,
        limit: usize,
        offset: usize,
    ) -> Result<History, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        let ledger = self.ledger.read();
        let Some(indexes) = ledger.by_wallet.get(&id) else {
            return Ok(History {
                entries: Vec::new(),
                total: 0,
            });
        };

        let mut newest_first = indexes.clone();
        newest_first.sort_by(|a, b| {
            ledger.rows[*b]
                .created_at
                .cmp(&ledger.rows[*a].created_at)
                .then(b.cmp(a))
        });
        let entries = newest_first
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|i| ledger.rows[i].clone())
            .collect();

        Ok(History {
            entries,
            total: indexes.len(),
        })
    }

    fn entries_by_reference(&self, reference: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        let ledger = self.ledger.read();
        Ok(ledger.rows_at(ledger.by_reference.get(reference)))
    }

    fn logs_created_before(
        &self,
        status: TransactionStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TransactionLog>, StoreError> {
        self.check_available()?;
        let _gate = self.commit_gate.read();
        Ok(self
            .logs
            .iter()
            .filter(|log| log.status == status && log.created_at < cutoff)
            .map(|log| log.clone())
            .collect())
    }
}

struct HeldRow {
    _guard: ArcMutexGuard<RawMutex, ()>,
    view: Wallet,
    dirty: bool,
}

/// Buffered atomic unit over a [`MemoryStore`].
pub struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    held: BTreeMap<WalletId, HeldRow>,
    last_locked: Option<WalletId>,
    inserted_wallets: BTreeMap<WalletId, Wallet>,
    entries: Vec<LedgerEntry>,
    logs: HashMap<TransactionLogId, TransactionLog>,
    reserved_keys: Vec<(IdempotencyKey, TransactionLogId)>,
    reserved_owners: Vec<(OwnerId, WalletId)>,
    committed: bool,
}

impl<'a> MemoryUnit<'a> {
    fn new(store: &'a MemoryStore) -> Self {
        Self {
            store,
            held: BTreeMap::new(),
            last_locked: None,
            inserted_wallets: BTreeMap::new(),
            entries: Vec::new(),
            logs: HashMap::new(),
            reserved_keys: Vec::new(),
            reserved_owners: Vec::new(),
            committed: false,
        }
    }
}

impl WalletRepository for MemoryUnit<'_> {
    fn lock_wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        self.store.check_available()?;
        if let Some(row) = self.held.get(&id) {
            return Ok(Some(row.view.clone()));
        }
        if let Some(wallet) = self.inserted_wallets.get(&id) {
            return Ok(Some(wallet.clone()));
        }
        if let Some(held) = self.last_locked {
            if id < held {
                return Err(StoreError::LockOrderViolation {
                    held: held.to_string(),
                    requested: id.to_string(),
                });
            }
        }

        // Release the map shard before blocking on the row lock.
        let Some(row) = self.store.wallets.get(&id).map(|row| Arc::clone(row.value())) else {
            return Ok(None);
        };
        let guard = row.lock.lock_arc();
        let view = row.committed.read().clone();
        debug!(wallet_id = %id, "wallet row locked");

        self.last_locked = Some(id);
        self.held.insert(
            id,
            HeldRow {
                _guard: guard,
                view: view.clone(),
                dirty: false,
            },
        );
        Ok(Some(view))
    }

    fn insert_wallet(&mut self, wallet: Wallet) -> Result<(), StoreError> {
        self.store.check_available()?;
        match self.store.owners.entry(wallet.owner_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                index: WALLET_OWNER_INDEX,
                key: wallet.owner_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(wallet.id);
                self.reserved_owners.push((wallet.owner_id.clone(), wallet.id));
                self.inserted_wallets.insert(wallet.id, wallet);
                Ok(())
            }
        }
    }

    fn update_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        self.store.check_available()?;
        if let Some(pending) = self.inserted_wallets.get_mut(&wallet.id) {
            *pending = wallet.clone();
            return Ok(());
        }
        let row = self
            .held
            .get_mut(&wallet.id)
            .ok_or_else(|| StoreError::RowNotLocked(wallet.id.to_string()))?;
        row.view = wallet.clone();
        row.dirty = true;
        Ok(())
    }
}

impl LedgerRepository for MemoryUnit<'_> {
    fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        self.store.check_available()?;
        self.entries.push(entry);
        Ok(())
    }
}

impl TransactionLogRepository for MemoryUnit<'_> {
    fn insert_log(&mut self, log: &TransactionLog) -> Result<(), StoreError> {
        self.store.check_available()?;
        // Entry API for atomic check-and-insert on the unique key.
        match self.store.keys.entry(log.idempotency_key.clone()) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                index: IDEMPOTENCY_KEY_INDEX,
                key: log.idempotency_key.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(log.id);
                self.reserved_keys.push((log.idempotency_key.clone(), log.id));
                self.logs.insert(log.id, log.clone());
                Ok(())
            }
        }
    }

    fn update_log(&mut self, log: &TransactionLog) -> Result<(), StoreError> {
        self.store.check_available()?;
        if !self.logs.contains_key(&log.id) && !self.store.logs.contains_key(&log.id) {
            return Err(StoreError::MissingRow(log.id.to_string()));
        }
        self.logs.insert(log.id, log.clone());
        Ok(())
    }
}

impl UnitOfWork for MemoryUnit<'_> {
    fn commit(mut self) -> Result<(), StoreError> {
        self.store.check_available()?;
        {
            let _gate = self.store.commit_gate.write();
            for (id, wallet) in std::mem::take(&mut self.inserted_wallets) {
                self.store.wallets.insert(id, Arc::new(WalletRow::new(wallet)));
            }
            for (id, row) in self.held.iter().filter(|(_, row)| row.dirty) {
                if let Some(stored) = self.store.wallets.get(id) {
                    *stored.committed.write() = row.view.clone();
                }
            }
            let mut ledger = self.store.ledger.write();
            for entry in self.entries.drain(..) {
                ledger.append(entry);
            }
            drop(ledger);
            for (id, log) in self.logs.drain() {
                self.store.logs.insert(id, log);
            }
        }
        self.committed = true;
        trace!(locks = self.held.len(), "unit committed");
        Ok(())
    }

    fn rollback(self) {
        trace!(locks = self.held.len(), "unit rolled back");
    }
}

impl Drop for MemoryUnit<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (key, id) in self.reserved_keys.drain(..) {
            self.store.keys.remove_if(&key, |_, owner| *owner == id);
        }
        for (owner_id, id) in self.reserved_owners.drain(..) {
            self.store.owners.remove_if(&owner_id, |_, owner| *owner == id);
        }
    }
}
