//! Registry of running server processes.
//!
//! All reads and writes go through one mutex that is only held for map
//! operations. A start moves an id through three states:
//!
//! * reserved: [`ProcessRegistry::reserve`] claimed the id before spawning,
//!   so a second start for the same id is refused before it forks a child;
//! * registered: [`Reservation::register`] published the live handle through
//!   [`ProcessRegistry::register`];
//! * deregistered: the [`Registration`] guard was dropped once exit was
//!   observed, removing exactly the handle it registered.
//!
//! Only registered ids are visible to [`ProcessRegistry::lookup`] and
//! [`ProcessRegistry::list`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

/// Writable end of a child's standard input.
pub type InputPipe = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance {0} is already running")]
    AlreadyRegistered(String),
}

/// A live server process as seen by everything outside the start task.
pub struct ProcessHandle {
    instance_id: String,
    name: String,
    pid: Option<u32>,
    started_at: Instant,
    stdin: tokio::sync::Mutex<Option<InputPipe>>,
    kill: Notify,
}

impl ProcessHandle {
    pub fn new(
        instance_id: impl Into<String>,
        name: impl Into<String>,
        pid: Option<u32>,
        stdin: Option<InputPipe>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            name: name.into(),
            pid,
            started_at: Instant::now(),
            stdin: tokio::sync::Mutex::new(stdin),
            kill: Notify::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Writes `line` plus a newline to the process's standard input.
    ///
    /// After the first failed write the pipe is dropped and later writes
    /// report `BrokenPipe` without touching the process.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "standard input is closed",
            ));
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let result = match stdin.write_all(&buf).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Asks the task waiting on this process to kill it.
    pub fn request_kill(&self) {
        self.kill.notify_one();
    }

    pub(crate) async fn kill_requested(&self) {
        self.kill.notified().await;
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum Slot {
    /// Reserved by a start that has not spawned yet.
    Starting,
    Running(Arc<ProcessHandle>),
}

/// Shared map from instance id to its live handle. Clones share state.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still guards valid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `id` for a start that has not spawned yet.
    pub fn reserve(&self, id: &str) -> Result<Reservation, RegistryError> {
        let mut slots = self.slots();
        if slots.contains_key(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        slots.insert(id.to_string(), Slot::Starting);
        Ok(Reservation {
            registry: self.clone(),
            id: id.to_string(),
            active: true,
        })
    }

    /// Inserts a live handle. An id with a live handle is refused.
    ///
    /// A pending reservation for `id` is consumed: the start holding it
    /// will then fail to register its own process.
    pub fn register(&self, id: &str, handle: Arc<ProcessHandle>) -> Result<(), RegistryError> {
        let mut slots = self.slots();
        if let Some(Slot::Running(_)) = slots.get(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        slots.insert(id.to_string(), Slot::Running(handle));
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        match self.slots().get(id) {
            Some(Slot::Running(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Removes `handle` from its id if it is still the one registered there.
    ///
    /// Removing an absent or replaced handle is a no-op and returns `false`.
    pub fn deregister(&self, handle: &Arc<ProcessHandle>) -> bool {
        let mut slots = self.slots();
        match slots.get(handle.instance_id()) {
            Some(Slot::Running(current)) if Arc::ptr_eq(current, handle) => {
                slots.remove(handle.instance_id());
                true
            }
            _ => false,
        }
    }

    /// Whether `handle` is still the registered handle for its id.
    pub fn is_current(&self, handle: &Arc<ProcessHandle>) -> bool {
        matches!(
            self.slots().get(handle.instance_id()),
            Some(Slot::Running(current)) if Arc::ptr_eq(current, handle)
        )
    }

    /// Snapshot of registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered processes. Pending reservations are not counted.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An id claimed for a pending start. Dropping it releases the claim.
#[must_use]
pub struct Reservation {
    registry: ProcessRegistry,
    id: String,
    active: bool,
}

impl Reservation {
    /// Publishes the spawned process under the reserved id.
    pub fn register(mut self, handle: Arc<ProcessHandle>) -> Result<Registration, RegistryError> {
        self.registry.register(&self.id, handle.clone())?;
        self.active = false;
        Ok(Registration {
            registry: self.registry.clone(),
            handle,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let mut slots = self.registry.slots();
        if let Some(Slot::Starting) = slots.get(&self.id) {
            slots.remove(&self.id);
        }
    }
}

/// Keeps a handle registered; dropping it deregisters.
#[must_use]
pub struct Registration {
    registry: ProcessRegistry,
    handle: Arc<ProcessHandle>,
}

impl Registration {
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn handle(id: &str) -> Arc<ProcessHandle> {
        Arc::new(ProcessHandle::new(id, id.to_uppercase(), None, None))
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = ProcessRegistry::new();
        let first = handle("a");
        registry.register("a", first.clone()).unwrap();
        assert_eq!(
            registry.register("a", handle("a")),
            Err(RegistryError::AlreadyRegistered("a".into()))
        );
        assert!(Arc::ptr_eq(&registry.lookup("a").unwrap(), &first));
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = ProcessRegistry::new();
        let a = handle("a");
        registry.register("a", a.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister(&a));
        assert!(!registry.deregister(&a));
        assert!(!registry.deregister(&handle("missing")));
        assert!(registry.is_empty());
    }

    #[test]
    fn reservation_blocks_second_start_and_releases_on_drop() {
        let registry = ProcessRegistry::new();
        let reservation = registry.reserve("a").unwrap();
        assert!(registry.reserve("a").is_err());
        assert!(registry.lookup("a").is_none());
        assert!(registry.list().is_empty());
        assert!(registry.is_empty());
        drop(reservation);
        assert!(registry.reserve("a").is_ok());
    }

    #[test]
    fn reservation_registers_through_the_registry() {
        let registry = ProcessRegistry::new();
        let first = handle("a");
        let registration = registry.reserve("a").unwrap().register(first.clone()).unwrap();
        assert!(Arc::ptr_eq(registration.handle(), &first));
        assert_eq!(registry.list(), vec!["a".to_string()]);
        assert_eq!(
            registry.register("a", handle("a")),
            Err(RegistryError::AlreadyRegistered("a".into()))
        );
        drop(registration);
        assert!(registry.lookup("a").is_none());
        assert!(registry.reserve("a").is_ok());
    }

    #[test]
    fn direct_register_wins_over_a_pending_reservation() {
        let registry = ProcessRegistry::new();
        let reservation = registry.reserve("a").unwrap();
        let direct = handle("a");
        registry.register("a", direct.clone()).unwrap();

        assert!(reservation.register(handle("a")).is_err());
        // The failed reservation must not release the live entry.
        assert!(Arc::ptr_eq(&registry.lookup("a").unwrap(), &direct));
    }

    #[test]
    fn registration_guard_deregisters_its_own_handle_only() {
        let registry = ProcessRegistry::new();
        let first = handle("a");
        let registration = registry.reserve("a").unwrap().register(first.clone()).unwrap();
        assert!(registry.is_current(&first));
        assert!(registry.reserve("a").is_err());

        // The entry was removed and replaced; the stale guard must leave the new one.
        assert!(registry.deregister(&first));
        let second = handle("a");
        registry.register("a", second.clone()).unwrap();
        drop(registration);
        assert!(Arc::ptr_eq(&registry.lookup("a").unwrap(), &second));
        assert!(!registry.is_current(&first));
    }

    #[test]
    fn concurrent_updates_on_distinct_ids_are_not_lost() {
        let registry = ProcessRegistry::new();
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let id = format!("w{}-{}", worker, n);
                        let process = handle(&id);
                        // Odd ids end registered, even ids are registered then removed.
                        registry.register(&id, process.clone()).unwrap();
                        assert!(registry.lookup(&id).is_some());
                        if n % 2 == 0 {
                            assert!(registry.deregister(&process));
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let mut expected: Vec<String> = (0..8)
            .flat_map(|w| (0..50).filter(|n| n % 2 == 1).map(move |n| format!("w{}-{}", w, n)))
            .collect();
        expected.sort();
        assert_eq!(registry.list(), expected);
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn concurrent_reservations_admit_one_winner() {
        let registry = ProcessRegistry::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry
                        .reserve("shared")
                        .map(|r| std::mem::forget(r))
                        .is_ok()
                })
            })
            .collect();
        let winners = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn write_line_appends_newline_and_closes_on_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let process = ProcessHandle::new("a", "A", Some(1), Some(Box::new(client)));
        process.write_line("say hi").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"say hi\n");

        drop(server);
        assert!(process.write_line("lost").await.is_err());
        let err = process.write_line("lost again").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
