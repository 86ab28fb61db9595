//! Session store, optionally backed by redb.
//!
//! Holds the single current token set, the session state and the pending
//! sign-in requests. Every transition that replaces or clears the token set
//! bumps `epoch`; long-running operations remember the epoch they started at
//! and commit only if nothing else happened in between.

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use super::types::{SessionState, SigninRequest, TokenSet};

/// redb table for the current user (single key, value: MessagePack bytes).
const USER_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oidc_user");

/// redb table for pending sign-in requests (key: state, value: MessagePack bytes).
const SIGNIN_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oidc_signin_requests");

const CURRENT_USER_KEY: &str = "current";

struct Inner {
    state: SessionState,
    user: Option<TokenSet>,
    epoch: u64,
    requests: HashMap<String, SigninRequest>,
}

/// Current session plus outstanding sign-in requests.
pub struct SessionStore {
    /// Persistent copy, absent for in-memory stores.
    db: Option<Database>,

    inner: RwLock<Inner>,

    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl SessionStore {
    /// Store that lives and dies with the process.
    pub fn in_memory() -> Self {
        Self {
            db: None,
            inner: RwLock::new(Inner {
                state: SessionState::SignedOut,
                user: None,
                epoch: 0,
                requests: HashMap::new(),
            }),
            #[cfg(test)]
            fail_writes: Default::default(),
        }
    }

    /// Open or create a persistent store at the given path.
    ///
    /// An unexpired persisted user resumes as `Authenticated`; an expired one is
    /// discarded.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USER_TABLE)?;
            let _ = write_txn.open_table(SIGNIN_TABLE)?;
        }
        write_txn.commit()?;

        let user = Self::load_user(&db)?;
        let requests = Self::load_requests(&db)?;

        debug!(
            user_loaded = user.is_some(),
            pending_requests = requests.len(),
            "Opened session store"
        );

        let state = if user.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::SignedOut
        };

        Ok(Self {
            db: Some(db),
            inner: RwLock::new(Inner {
                state,
                user,
                epoch: 0,
                requests,
            }),
            #[cfg(test)]
            fail_writes: Default::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .read()
            .map(|i| i.state)
            .unwrap_or(SessionState::SignedOut)
    }

    /// The current token set, if any.
    pub fn user(&self) -> Option<TokenSet> {
        self.inner.read().ok().and_then(|i| i.user.clone())
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().map(|i| i.epoch).unwrap_or(0)
    }

    /// Move to `next` if the current state is one of `allowed`.
    ///
    /// Returns the new epoch; a refused move fails with [`InvalidTransition`].
    /// The token set is left untouched.
    pub fn begin(&self, allowed: &[SessionState], next: SessionState) -> Result<u64> {
        let mut inner = self.write()?;
        if !allowed.contains(&inner.state) {
            return Err(InvalidTransition(inner.state).into());
        }
        inner.state = next;
        inner.epoch += 1;
        Ok(inner.epoch)
    }

    /// Install `user` as the current token set if the epoch is still `epoch`.
    ///
    /// Returns the new epoch on success, `None` when another transition won.
    pub fn replace_if_epoch(&self, epoch: u64, user: TokenSet) -> Result<Option<u64>> {
        let mut inner = self.write()?;
        if inner.epoch != epoch {
            return Ok(None);
        }
        self.persist_user(Some(&user))?;
        inner.user = Some(user);
        inner.state = SessionState::Authenticated;
        inner.epoch += 1;
        Ok(Some(inner.epoch))
    }

    /// Drop the token set and move to `Expired` if the epoch is still `epoch`.
    pub fn expire_if_epoch(&self, epoch: u64) -> Result<bool> {
        self.reset_if_epoch(epoch, SessionState::Expired)
    }

    /// Drop the token set and move to `next` if the epoch is still `epoch`.
    ///
    /// The in-memory session is dropped even when removing the persisted copy
    /// fails; the error is still returned.
    pub fn reset_if_epoch(&self, epoch: u64, next: SessionState) -> Result<bool> {
        let mut inner = self.write()?;
        if inner.epoch != epoch {
            return Ok(false);
        }
        inner.user = None;
        inner.state = next;
        inner.epoch += 1;
        self.persist_user(None)?;
        Ok(true)
    }

    /// Unconditionally drop the token set and move to `next`.
    ///
    /// Returns the token set that was current. As with
    /// [`reset_if_epoch`](Self::reset_if_epoch), a persistence failure is
    /// reported only after memory has been cleared.
    pub fn clear(&self, next: SessionState) -> Result<Option<TokenSet>> {
        let mut inner = self.write()?;
        let previous = inner.user.take();
        inner.state = next;
        inner.epoch += 1;
        self.persist_user(None)?;
        Ok(previous)
    }

    pub fn save_request(&self, request: &SigninRequest) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(db) = &self.db {
            let data = rmp_serde::to_vec(request).context("Failed to serialize sign-in request")?;
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SIGNIN_TABLE)?;
                table.insert(request.state.as_str(), data.as_slice())?;
            }
            write_txn.commit()?;
        }
        inner.requests.insert(request.state.clone(), request.clone());
        Ok(())
    }

    /// Remove and return the request for `state`. A request is taken at most once.
    pub fn take_request(&self, state: &str) -> Result<Option<SigninRequest>> {
        let mut inner = self.write()?;
        let request = inner.requests.remove(state);
        if request.is_some() {
            self.remove_persisted_requests(&[state.to_string()])?;
        }
        Ok(request)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.read().map(|i| i.requests.len()).unwrap_or(0)
    }

    /// Evict sign-in requests older than `max_age`. Returns the number evicted.
    pub fn evict_stale_requests(&self, max_age: Duration) -> Result<usize> {
        let mut inner = self.write()?;
        let stale: Vec<String> = inner
            .requests
            .values()
            .filter(|r| r.is_stale(max_age))
            .map(|r| r.state.clone())
            .collect();

        self.remove_persisted_requests(&stale)?;
        for state in &stale {
            inner.requests.remove(state);
        }
        Ok(stale.len())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| anyhow!("Lock poisoned"))
    }

    fn persist_user(&self, user: Option<&TokenSet>) -> Result<()> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("Storage write refused"));
        }
        let Some(db) = &self.db else {
            return Ok(());
        };
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(USER_TABLE)?;
            match user {
                Some(user) => {
                    let data = rmp_serde::to_vec(user).context("Failed to serialize token set")?;
                    table.insert(CURRENT_USER_KEY, data.as_slice())?;
                }
                None => {
                    table.remove(CURRENT_USER_KEY)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_persisted_requests(&self, states: &[String]) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        if states.is_empty() {
            return Ok(());
        }
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SIGNIN_TABLE)?;
            for state in states {
                table.remove(state.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_user(db: &Database) -> Result<Option<TokenSet>> {
        let stored = {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(USER_TABLE)?;
            let decoded = match table.get(CURRENT_USER_KEY)? {
                Some(value) => Some(rmp_serde::from_slice::<TokenSet>(value.value())),
                None => None,
            };
            decoded
        };

        match stored {
            Some(Ok(user)) if !user.is_expired() => Ok(Some(user)),
            Some(Ok(_)) => {
                debug!("Discarding expired persisted token set");
                Self::remove_user(db)?;
                Ok(None)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to deserialize persisted token set, discarding");
                Self::remove_user(db)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn remove_user(db: &Database) -> Result<()> {
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(USER_TABLE)?;
            table.remove(CURRENT_USER_KEY)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_requests(db: &Database) -> Result<HashMap<String, SigninRequest>> {
        let mut requests = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SIGNIN_TABLE)?;

        for entry in table.iter()? {
            let (key, value) = entry?;
            match rmp_serde::from_slice::<SigninRequest>(value.value()) {
                Ok(request) => {
                    requests.insert(request.state.clone(), request);
                }
                Err(e) => {
                    warn!(key = key.value(), error = %e, "Skipping unreadable sign-in request");
                }
            }
        }

        Ok(requests)
    }
}

/// Refusal of [`SessionStore::begin`], carrying the state at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition(pub SessionState);

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transition not allowed from {}", self.0)
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
impl SessionStore {
    /// Make every token set write fail until switched back.
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}
