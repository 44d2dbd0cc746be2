//! Session bookkeeping.
//!
//! `SessionRegistry` is the injectable session table: add-if-absent through a
//! reservation taken before any process is spawned, a single remove on stop.
//! `PortLedger` makes listen ports exclusive within the process. `Sessions`
//! ties both to the configuration and executor and is what a front end holds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::{
    ChannelSession, CommandOutput, ReverseShellSession, SessionStatus, SshSession, SshTarget,
};
use crate::config::{Config, ListenerKind};
use crate::error::{RegistryError, SessionError};
use crate::exec::Executor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the table leaves it structurally intact.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Table<S> {
    live: HashMap<String, Arc<S>>,
    reserved: HashSet<String>,
}

/// Thread-safe map from session id to a live session.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    table: Mutex<Table<S>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                live: HashMap::new(),
                reserved: HashSet::new(),
            }),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` while the session is being started. Dropping the
    /// reservation without committing frees the id again.
    pub fn reserve(&self, id: &str) -> Result<Reservation<'_, S>, RegistryError> {
        let mut table = lock(&self.table);
        if table.live.contains_key(id) || table.reserved.contains(id) {
            return Err(RegistryError::DuplicateSession(id.to_string()));
        }
        table.reserved.insert(id.to_string());
        Ok(Reservation {
            registry: self,
            id: id.to_string(),
            committed: false,
        })
    }

    /// Insert an already-built session if the id is free.
    pub fn put(&self, id: &str, session: Arc<S>) -> Result<(), RegistryError> {
        self.reserve(id)?.commit(session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        lock(&self.table).live.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<S>> {
        lock(&self.table).live.remove(id)
    }

    /// Live session ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.table).live.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live sessions ordered by id.
    pub fn list(&self) -> Vec<Arc<S>> {
        let table = lock(&self.table);
        let mut entries: Vec<(&String, &Arc<S>)> = table.live.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, s)| Arc::clone(s)).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<Arc<S>> {
        lock(&self.table).live.drain().map(|(_, s)| s).collect()
    }
}

/// A pending id claim. See [`SessionRegistry::reserve`].
#[derive(Debug)]
pub struct Reservation<'a, S> {
    registry: &'a SessionRegistry<S>,
    id: String,
    committed: bool,
}

impl<S> Reservation<'_, S> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn commit(mut self, session: Arc<S>) {
        let mut table = lock(&self.registry.table);
        table.reserved.remove(&self.id);
        table.live.insert(self.id.clone(), session);
        self.committed = true;
    }
}

impl<S> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if !self.committed {
            lock(&self.registry.table).reserved.remove(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// PortLedger
// ---------------------------------------------------------------------------

/// Listen ports held by sessions of this process.
#[derive(Debug, Default)]
pub struct PortLedger {
    held: Mutex<HashMap<u16, String>>,
}

impl PortLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, port: u16, owner: &str) -> Result<(), RegistryError> {
        let mut held = lock(&self.held);
        if held.contains_key(&port) {
            return Err(RegistryError::PortInUse(port));
        }
        held.insert(port, owner.to_string());
        Ok(())
    }

    pub fn release(&self, port: u16) {
        lock(&self.held).remove(&port);
    }

    pub fn holder(&self, port: u16) -> Option<String> {
        lock(&self.held).get(&port).cloned()
    }
}

// ---------------------------------------------------------------------------
// Sessions facade
// ---------------------------------------------------------------------------

/// All live sessions of one service process.
#[derive(Debug)]
pub struct Sessions {
    config: Config,
    executor: Executor,
    ssh: SessionRegistry<SshSession>,
    shells: SessionRegistry<ReverseShellSession>,
    ports: PortLedger,
}

impl Sessions {
    pub fn new(config: Config) -> Self {
        let executor = Executor::from_config(&config);
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: Config, executor: Executor) -> Self {
        Self {
            config,
            executor,
            ssh: SessionRegistry::new(),
            shells: SessionRegistry::new(),
            ports: PortLedger::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub async fn start_ssh(
        &self,
        session_id: &str,
        target: SshTarget,
    ) -> Result<SessionStatus, SessionError> {
        let reservation = self.ssh.reserve(session_id)?;
        let session = Arc::new(SshSession::start(session_id, target, &self.config).await?);
        let status = session.status();
        reservation.commit(session);
        Ok(status)
    }

    /// Start a listener. `listener` falls back to the configured kind.
    pub async fn start_listener(
        &self,
        session_id: &str,
        port: u16,
        listener: Option<ListenerKind>,
    ) -> Result<SessionStatus, SessionError> {
        let reservation = self.shells.reserve(session_id)?;
        self.ports.claim(port, session_id)?;
        let listener = listener.unwrap_or(self.config.reverse_shell.listener);
        let started = ReverseShellSession::start(
            session_id,
            port,
            listener,
            &self.config,
            self.executor.clone(),
        )
        .await;
        match started {
            Ok(session) => {
                let session = Arc::new(session);
                let status = session.status();
                reservation.commit(session);
                Ok(status)
            }
            Err(err) => {
                self.ports.release(port);
                Err(err)
            }
        }
    }

    pub fn ssh_session(&self, session_id: &str) -> Result<Arc<SshSession>, SessionError> {
        self.ssh
            .get(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()).into())
    }

    pub fn reverse_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<ReverseShellSession>, SessionError> {
        self.shells
            .get(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()).into())
    }

    /// Either kind of session, for callers such as the transfer engine that
    /// only need a framed channel.
    pub fn channel(&self, session_id: &str) -> Result<Arc<dyn ChannelSession>, SessionError> {
        if let Some(session) = self.ssh.get(session_id) {
            return Ok(session as Arc<dyn ChannelSession>);
        }
        self.reverse_session(session_id)
            .map(|session| session as Arc<dyn ChannelSession>)
    }

    pub async fn ssh_command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError> {
        self.ssh_session(session_id)?
            .send_command(command, timeout)
            .await
    }

    pub async fn shell_command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError> {
        self.reverse_session(session_id)?
            .send_command(command, timeout)
            .await
    }

    pub fn trigger(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        self.reverse_session(session_id)?.trigger(command, timeout)
    }

    pub async fn wait_for_connection(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        Ok(self
            .reverse_session(session_id)?
            .wait_for_connection(timeout)
            .await)
    }

    pub async fn stop_ssh(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .ssh
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        session.stop().await;
        Ok(())
    }

    pub async fn stop_listener(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .shells
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        session.stop().await;
        self.ports.release(session.port());
        Ok(())
    }

    pub fn list_ssh(&self) -> Vec<SessionStatus> {
        self.ssh.list().iter().map(|s| s.status()).collect()
    }

    pub fn list_listeners(&self) -> Vec<SessionStatus> {
        self.shells.list().iter().map(|s| s.status()).collect()
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.channel(session_id).ok().map(|session| session.status())
    }

    /// Stop every session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for session in self.ssh.drain() {
            session.stop().await;
            stopped += 1;
        }
        for session in self.shells.drain() {
            session.stop().await;
            self.ports.release(session.port());
            stopped += 1;
        }
        if stopped > 0 {
            tracing::info!(stopped, "all sessions stopped");
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind(("0.0.0.0", 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("ephemeral port")
    }

    fn sleeper_sessions() -> Sessions {
        let mut config = Config::default();
        config.reverse_shell.listener = ListenerKind::Custom;
        config.reverse_shell.custom_program = Some("sleep".into());
        config.reverse_shell.custom_args = vec!["30".into()];
        config.reverse_shell.spawn_check_ms = 100;
        config.reverse_shell.kill_grace_secs = 1;
        config.reverse_shell.force_port_cleanup = false;
        Sessions::new(config)
    }

    #[test]
    fn reservation_blocks_duplicates_until_dropped() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let pending = registry.reserve("a").expect("first reservation");
        assert!(matches!(
            registry.reserve("a"),
            Err(RegistryError::DuplicateSession(_))
        ));
        drop(pending);
        let pending = registry.reserve("a").expect("freed after drop");
        pending.commit(Arc::new(1));
        assert!(matches!(
            registry.put("a", Arc::new(2)),
            Err(RegistryError::DuplicateSession(_))
        ));
        assert_eq!(registry.get("a").as_deref(), Some(&1));
    }

    #[test]
    fn list_is_sorted_and_remove_is_single() {
        let registry = SessionRegistry::new();
        for (id, n) in [("c", 3), ("a", 1), ("b", 2)] {
            registry.put(id, Arc::new(n)).unwrap();
        }
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);
        let values: Vec<i32> = registry.list().iter().map(|v| **v).collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(registry.remove("b").is_some());
        assert!(registry.remove("b").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn port_ledger_is_exclusive() {
        let ledger = PortLedger::new();
        ledger.claim(4444, "one").unwrap();
        assert!(matches!(ledger.claim(4444, "two"), Err(RegistryError::PortInUse(4444))));
        assert_eq!(ledger.holder(4444).as_deref(), Some("one"));
        ledger.release(4444);
        ledger.claim(4444, "two").unwrap();
    }

    #[tokio::test]
    async fn second_listener_on_same_port_is_rejected() {
        let sessions = sleeper_sessions();
        let port = free_port();
        let status = sessions
            .start_listener("first", port, None)
            .await
            .expect("first listener");
        assert_eq!(status.listen_port, Some(port));

        let err = sessions.start_listener("second", port, None).await.unwrap_err();
        assert!(matches!(err, SessionError::ResourceConflict(_)), "got: {err}");
        assert_eq!(sessions.list_listeners().len(), 1);

        sessions.stop_listener("first").await.expect("stop");
        assert!(sessions.status("first").is_none());
        sessions
            .start_listener("second", port, None)
            .await
            .expect("port is free after stop");
        assert_eq!(sessions.stop_all().await, 1);
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let sessions = sleeper_sessions();
        let err = sessions.ssh_command("nope", "id", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(ref id) if id == "nope"), "got: {err}");
        assert!(!err.is_connection_error());
        assert!(matches!(
            sessions.trigger("nope", "true", Duration::from_secs(1)),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            sessions.stop_listener("nope").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(sessions.list_ssh().is_empty());
    }

    #[tokio::test]
    async fn failed_start_releases_id_and_port() {
        let sessions = sleeper_sessions();
        let port = free_port();
        let mut config = sessions.config().clone();
        config.reverse_shell.custom_program = Some("false".into());
        config.reverse_shell.custom_args.clear();
        let failing = Sessions::new(config);
        assert!(failing.start_listener("x", port, None).await.is_err());
        assert!(failing.ports.holder(port).is_none());
        assert!(failing.shells.reserve("x").is_ok());
    }
}
