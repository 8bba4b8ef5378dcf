//! Credential-store collaborator for the login and registration forms.
//!
//! The server only sees [`CredentialStore`]. A real deployment plugs in a
//! [`PooledCredentialStore`] over its own [`CredentialClient`] driver; the
//! in-memory table is enough for tests and the bundled binary.

use crate::error::{EtudeError, EtudeResult};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub trait CredentialStore: Send + Sync {
    /// `is_login`: the user must exist with this password.
    /// Otherwise register: the user must not exist yet, and is then created.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> EtudeResult<bool>;
}

/// One synchronous handle to the user table.
pub trait CredentialClient: Send {
    /// Stored password for `username`.
    fn lookup(&mut self, username: &str) -> EtudeResult<Option<String>>;
    /// Create `username` unless it already exists. False if it did.
    fn insert(&mut self, username: &str, password: &str) -> EtudeResult<bool>;
}

fn verify_with<C: CredentialClient + ?Sized>(
    client: &mut C,
    username: &str,
    password: &str,
    is_login: bool,
) -> EtudeResult<bool> {
    if username.is_empty() || password.is_empty() {
        return Ok(false);
    }
    let stored = client.lookup(username)?;
    let ok = match (is_login, stored) {
        (true, Some(pw)) => pw == password,
        (true, None) => false,
        (false, Some(_)) => false,
        // The insert decides: a concurrent registration may have won since
        // the lookup.
        (false, None) => client.insert(username, password)?,
    };
    tracing::debug!(user = username, is_login, ok, "credential check");
    Ok(ok)
}

// ---- Blocking client pool ----

/// Fixed set of clients shared by all workers. Checkout blocks until a
/// client is free; the guard hands it back on drop.
pub struct ClientPool<C> {
    idle: Mutex<Vec<C>>,
    available: Condvar,
    size: usize,
}

impl<C> ClientPool<C> {
    pub fn new(clients: Vec<C>) -> EtudeResult<Self> {
        if clients.is_empty() {
            return Err(EtudeError::PoolExhausted);
        }
        Ok(Self {
            size: clients.len(),
            idle: Mutex::new(clients),
            available: Condvar::new(),
        })
    }

    /// Eagerly open `size` clients.
    pub fn connect<F>(size: usize, mut open: F) -> EtudeResult<Self>
    where
        F: FnMut() -> EtudeResult<C>,
    {
        let clients = (0..size).map(|_| open()).collect::<EtudeResult<Vec<_>>>()?;
        Self::new(clients)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<C>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> PooledClient<'_, C> {
        let mut idle = self.lock();
        loop {
            if let Some(client) = idle.pop() {
                return PooledClient {
                    pool: self,
                    client: Some(client),
                };
            }
            idle = self
                .available
                .wait(idle)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn try_get(&self) -> Option<PooledClient<'_, C>> {
        self.lock().pop().map(|client| PooledClient {
            pool: self,
            client: Some(client),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.lock().len()
    }
}

pub struct PooledClient<'a, C> {
    pool: &'a ClientPool<C>,
    client: Option<C>,
}

impl<C> Deref for PooledClient<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client.as_ref().expect("client present until drop")
    }
}

impl<C> DerefMut for PooledClient<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client.as_mut().expect("client present until drop")
    }
}

impl<C> Drop for PooledClient<'_, C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.lock().push(client);
            self.pool.available.notify_one();
        }
    }
}

/// [`CredentialStore`] that checks out a pooled client per query.
pub struct PooledCredentialStore<C> {
    pool: ClientPool<C>,
}

impl<C: CredentialClient> PooledCredentialStore<C> {
    pub fn new(pool: ClientPool<C>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ClientPool<C> {
        &self.pool
    }
}

impl<C: CredentialClient> CredentialStore for PooledCredentialStore<C> {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> EtudeResult<bool> {
        let mut client = self.pool.get();
        verify_with(&mut *client, username, password, is_login)
    }
}

// ---- In-memory table ----

type UserTable = Arc<Mutex<HashMap<String, String>>>;

/// Process-local user table.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    users: UserTable,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, username: &str, password: &str) -> Self {
        lock_table(&self.users).insert(username.to_string(), password.to_string());
        self
    }

    pub fn contains(&self, username: &str) -> bool {
        lock_table(&self.users).contains_key(username)
    }

    /// A client handle onto the same table, for use behind a [`ClientPool`].
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            users: self.users.clone(),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> EtudeResult<bool> {
        verify_with(&mut self.client(), username, password, is_login)
    }
}

pub struct MemoryClient {
    users: UserTable,
}

impl CredentialClient for MemoryClient {
    fn lookup(&mut self, username: &str) -> EtudeResult<Option<String>> {
        Ok(lock_table(&self.users).get(username).cloned())
    }

    fn insert(&mut self, username: &str, password: &str) -> EtudeResult<bool> {
        match lock_table(&self.users).entry(username.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(password.to_string());
                Ok(true)
            }
        }
    }
}

fn lock_table(users: &UserTable) -> MutexGuard<'_, HashMap<String, String>> {
    users.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn login_and_register_rules() {
        let store = MemoryCredentialStore::new().with_user("alice", "secret");

        assert!(store.verify("alice", "secret", true).unwrap());
        assert!(!store.verify("alice", "wrong", true).unwrap());
        assert!(!store.verify("bob", "pw", true).unwrap());

        assert!(!store.verify("alice", "other", false).unwrap());
        assert!(store.verify("bob", "pw", false).unwrap());
        assert!(store.contains("bob"));
        assert!(store.verify("bob", "pw", true).unwrap());

        assert!(!store.verify("", "pw", false).unwrap());
        assert!(!store.verify("carol", "", false).unwrap());
        assert!(!store.contains("carol"));
    }

    /// A client whose lookup never sees rows added by others, like a
    /// registration racing another one between its lookup and insert.
    struct StaleLookupClient(MemoryClient);

    impl CredentialClient for StaleLookupClient {
        fn lookup(&mut self, _: &str) -> EtudeResult<Option<String>> {
            Ok(None)
        }

        fn insert(&mut self, username: &str, password: &str) -> EtudeResult<bool> {
            self.0.insert(username, password)
        }
    }

    #[test]
    fn racing_registrations_only_one_wins() {
        let table = MemoryCredentialStore::new();
        let store = PooledCredentialStore::new(
            ClientPool::connect(2, || Ok(StaleLookupClient(table.client()))).unwrap(),
        );

        assert!(store.verify("dave", "first", false).unwrap());
        assert!(!store.verify("dave", "second", false).unwrap());
        assert!(table.verify("dave", "first", true).unwrap());
        assert!(!table.verify("dave", "second", true).unwrap());
    }

    #[test]
    fn concurrent_registrations_of_one_name_admit_a_single_winner() {
        let table = MemoryCredentialStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                thread::spawn(move || table.verify("erin", &format!("pw{}", i), false).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn pool_blocks_until_a_client_is_returned() {
        let table = MemoryCredentialStore::new();
        let pool = Arc::new(ClientPool::connect(1, || Ok(table.client())).unwrap());
        assert_eq!(pool.size(), 1);

        let held = pool.get();
        assert!(pool.try_get().is_none());

        let waited = Arc::new(AtomicUsize::new(0));
        let handle = {
            let pool = pool.clone();
            let waited = waited.clone();
            thread::spawn(move || {
                let _client = pool.get();
                waited.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(waited.load(Ordering::SeqCst), 0);
        drop(held);
        handle.join().unwrap();
        assert_eq!(waited.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            ClientPool::<MemoryClient>::new(Vec::new()),
            Err(EtudeError::PoolExhausted)
        ));
    }

    struct FailingClient;

    impl CredentialClient for FailingClient {
        fn lookup(&mut self, _: &str) -> EtudeResult<Option<String>> {
            Err(EtudeError::Credential("connection refused".into()))
        }

        fn insert(&mut self, _: &str, _: &str) -> EtudeResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn pooled_store_surfaces_client_errors() {
        let store =
            PooledCredentialStore::new(ClientPool::connect(2, || Ok(FailingClient)).unwrap());
        assert!(matches!(
            store.verify("alice", "pw", true),
            Err(EtudeError::Credential(_))
        ));
        assert_eq!(store.pool().idle(), 2);
    }
}
