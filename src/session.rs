//! Board sessions and exclusive link leases.
//!
//! A [`BoardSession`] is the single owner of one board's [`Link`] plus the
//! driver state learned from it (last position, configured parameters). Every
//! exchange goes through a [`LinkLease`], obtained with
//! [`BoardSession::lease`]:
//!
//! - Leasing never waits. If someone else holds the link (an acquisition loop
//!   or another command in flight) the call fails at once with
//!   [`LinkError::Concurrency`] naming the holder.
//! - The lease is released when it is dropped, on every exit path,
//!   including timeouts and I/O failures.
//! - A fatal error observed through the lease (`Connect`/`Io`) closes the
//!   transport and marks the session disconnected. Later leases fail with
//!   [`LinkError::NotConnected`] until [`BoardSession::reconnect`].
//!
//! Other parts of an application get a read-only [`SessionStatus`].

use crate::codec::{Command, Frame};
use crate::error::{LinkError, LinkResult};
use crate::exchange::{CommandClass, ExchangeTimeouts, Link};
use crate::transport::Transport;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Shared<S> {
    port: String,
    connected: AtomicBool,
    holder: Mutex<Option<String>>,
    state: Mutex<S>,
}

/// Exclusive owner of one board link and its driver state `S`.
#[derive(Debug)]
pub struct BoardSession<S> {
    name: String,
    link: Arc<tokio::sync::Mutex<Link>>,
    shared: Arc<Shared<S>>,
}

impl<S: Default + Clone + Send + std::fmt::Debug + 'static> BoardSession<S> {
    /// Start a session on an already opened link.
    pub fn new(name: &str, link: Link) -> Self {
        let port = link.port_name().to_string();
        info!(board = name, port = %port, "board session started");
        Self {
            name: name.to_string(),
            link: Arc::new(tokio::sync::Mutex::new(link)),
            shared: Arc::new(Shared {
                port,
                connected: AtomicBool::new(true),
                holder: Mutex::new(None),
                state: Mutex::new(S::default()),
            }),
        }
    }

    /// Board name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port the session was opened on.
    pub fn port_name(&self) -> &str {
        &self.shared.port
    }

    /// Whether the session is usable.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Current lease holder, if any.
    pub fn holder(&self) -> Option<String> {
        lock(&self.shared.holder).clone()
    }

    /// Read-only view for other consumers.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            shared: self.shared.clone(),
        }
    }

    /// Snapshot of the driver state.
    pub fn state(&self) -> S {
        lock(&self.shared.state).clone()
    }

    /// Mutate the driver state.
    pub fn update_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.shared.state))
    }

    /// Handle that lets a background task update the driver state.
    pub fn state_handle(&self) -> StateHandle<S> {
        StateHandle {
            shared: self.shared.clone(),
        }
    }

    /// Take exclusive use of the link for `owner`.
    ///
    /// # Errors
    /// - [`LinkError::NotConnected`] if the session was torn down.
    /// - [`LinkError::Concurrency`] if the link is already leased.
    pub fn lease(&self, owner: &str) -> LinkResult<LinkLease> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected(self.shared.port.clone()));
        }
        self.lease_unchecked(owner)
    }

    fn lease_unchecked(&self, owner: &str) -> LinkResult<LinkLease> {
        let guard = self.link.clone().try_lock_owned().map_err(|_| {
            let held_by = self.holder().unwrap_or_else(|| "unknown".to_string());
            debug!(port = %self.shared.port, owner, held_by = %held_by, "lease refused");
            LinkError::Concurrency {
                port: self.shared.port.clone(),
                held_by,
            }
        })?;
        *lock(&self.shared.holder) = Some(owner.to_string());
        Ok(LinkLease {
            guard,
            owner: owner.to_string(),
            release: Box::new(LeaseRelease {
                shared: self.shared.clone(),
            }),
        })
    }

    /// Close the link and tear down the driver state.
    ///
    /// # Errors
    /// [`LinkError::Concurrency`] if the link is in use.
    pub async fn disconnect(&self) -> LinkResult<()> {
        let mut lease = self.lease_unchecked("disconnect")?;
        let result = lease.guard.close().await;
        self.shared.connected.store(false, Ordering::SeqCst);
        *lock(&self.shared.state) = S::default();
        info!(board = %self.name, port = %self.shared.port, "board session closed");
        result
    }

    /// Install a freshly opened transport and mark the session connected
    /// again. Driver state starts over.
    ///
    /// # Errors
    /// [`LinkError::Concurrency`] if the link is in use.
    pub fn reconnect(&self, transport: Box<dyn Transport>) -> LinkResult<()> {
        let mut lease = self.lease_unchecked("reconnect")?;
        lease.guard.replace_transport(transport);
        *lock(&self.shared.state) = S::default();
        self.shared.connected.store(true, Ordering::SeqCst);
        info!(board = %self.name, port = %self.shared.port, "board session reconnected");
        Ok(())
    }

    /// Close the current transport, then install the one `open` returns.
    ///
    /// The old handle is released before `open` runs, so the same port can
    /// be opened again. The link stays leased throughout. Driver state starts
    /// over.
    ///
    /// # Errors
    /// [`LinkError::Concurrency`] if the link is in use; whatever `open`
    /// returns, in which case the session stays disconnected.
    pub async fn reopen<F, Fut>(&self, open: F) -> LinkResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LinkResult<Box<dyn Transport>>>,
    {
        let mut lease = self.lease_unchecked("reconnect")?;
        if let Err(e) = lease.guard.close().await {
            debug!(port = %self.shared.port, error = %e, "closing old transport failed");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        *lock(&self.shared.state) = S::default();

        let transport = open().await?;
        lease.guard.replace_transport(transport);
        self.shared.connected.store(true, Ordering::SeqCst);
        info!(board = %self.name, port = %self.shared.port, "board session reopened");
        Ok(())
    }
}

/// Read-only session status for consumers that do not own the board.
#[derive(Debug)]
pub struct SessionStatus {
    shared: Arc<dyn StatusView>,
}

impl Clone for SessionStatus {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

trait StatusView: Send + Sync + std::fmt::Debug {
    fn port(&self) -> &str;
    fn connected(&self) -> bool;
    fn holder(&self) -> Option<String>;
}

impl<S: Send + std::fmt::Debug> StatusView for Shared<S> {
    fn port(&self) -> &str {
        &self.port
    }
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn holder(&self) -> Option<String> {
        lock(&self.holder).clone()
    }
}

impl SessionStatus {
    /// Port name.
    pub fn port_name(&self) -> &str {
        self.shared.port()
    }

    /// Whether the session is usable.
    pub fn is_connected(&self) -> bool {
        self.shared.connected()
    }

    /// Whether some owner currently holds the link.
    pub fn is_busy(&self) -> bool {
        self.shared.holder().is_some()
    }

    /// Current lease holder.
    pub fn holder(&self) -> Option<String> {
        self.shared.holder()
    }
}

/// Shared handle to a session's driver state.
#[derive(Debug)]
pub struct StateHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Clone> StateHandle<S> {
    /// Snapshot of the state.
    pub fn get(&self) -> S {
        lock(&self.shared.state).clone()
    }

    /// Mutate the state.
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.shared.state))
    }
}

trait ReleaseHook: Send + Sync + std::fmt::Debug {
    fn release(&self);
    fn mark_disconnected(&self);
}

#[derive(Debug)]
struct LeaseRelease<S> {
    shared: Arc<Shared<S>>,
}

impl<S: Send + std::fmt::Debug> ReleaseHook for LeaseRelease<S> {
    fn release(&self) {
        *lock(&self.shared.holder) = None;
    }

    fn mark_disconnected(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

/// Exclusive use of a link. Released on drop.
#[derive(Debug)]
pub struct LinkLease {
    guard: OwnedMutexGuard<Link>,
    owner: String,
    release: Box<dyn ReleaseHook>,
}

impl LinkLease {
    /// Who holds this lease.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Port of the leased link.
    pub fn port_name(&self) -> &str {
        self.guard.port_name()
    }

    /// Configured deadlines of the leased link.
    pub fn timeouts(&self) -> ExchangeTimeouts {
        *self.guard.timeouts()
    }

    async fn observe<T>(&mut self, result: LinkResult<T>) -> LinkResult<T> {
        if let Err(e) = &result {
            if e.is_link_fatal() {
                warn!(port = %self.guard.port_name(), owner = %self.owner, error = %e, "link lost, session marked disconnected");
                self.release.mark_disconnected();
                // Frees the port so it can be opened again for a reconnect.
                if let Err(close) = self.guard.close().await {
                    debug!(port = %self.guard.port_name(), error = %close, "closing lost link failed");
                }
            }
        }
        result
    }

    /// See [`Link::exchange`].
    pub async fn exchange(&mut self, command: &Command, class: CommandClass) -> LinkResult<Frame> {
        let result = self.guard.exchange(command, class).await;
        self.observe(result).await
    }

    /// See [`Link::exchange_within`].
    pub async fn exchange_within(
        &mut self,
        command: &Command,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Frame> {
        let result = self.guard.exchange_within(command, deadline, cancel).await;
        self.observe(result).await
    }

    /// See [`Link::send_only`].
    pub async fn send_only(&mut self, command: &Command) -> LinkResult<()> {
        let result = self.guard.send_only(command).await;
        self.observe(result).await
    }

    /// See [`Link::exchange_raw`].
    pub async fn exchange_raw(
        &mut self,
        bytes: &[u8],
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Vec<u8>> {
        let result = self.guard.exchange_raw(bytes, deadline, cancel).await;
        self.observe(result).await
    }

    /// See [`Link::read_frame`].
    pub async fn read_frame(
        &mut self,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Frame> {
        let result = self.guard.read_frame(deadline, cancel).await;
        self.observe(result).await
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        self.release.release();
        debug!(owner = %self.owner, "lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DelimitedAscii;
    use crate::transport::MockTransport;

    #[derive(Debug, Clone, Default)]
    struct Counter {
        exchanges: u32,
    }

    fn session(board: &MockTransport) -> BoardSession<Counter> {
        let codec = DelimitedAscii::new(b'!').with_start(b'_').with_verb_prefix(1);
        let link = Link::new(
            Box::new(board.clone()),
            Box::new(codec),
            ExchangeTimeouts::default(),
        );
        BoardSession::new("piezo", link)
    }

    #[tokio::test]
    async fn second_lease_fails_fast_with_holder() {
        let board = MockTransport::new("mock-session");
        let session = session(&board);

        let first = session.lease("live-view").unwrap();
        match session.lease("button") {
            Err(LinkError::Concurrency { held_by, .. }) => assert_eq!(held_by, "live-view"),
            other => panic!("expected concurrency error, got {other:?}"),
        }
        assert!(session.status().is_busy());

        drop(first);
        assert!(!session.status().is_busy());
        assert!(session.lease("button").is_ok());
    }

    #[tokio::test]
    async fn io_failure_disconnects_until_reconnect() {
        let board = MockTransport::new("mock-session").respond("_V!", "_V2!");
        let session = session(&board);

        board.inject_write_failure();
        {
            let mut lease = session.lease("probe").unwrap();
            let err = lease
                .exchange(&Command::new("V"), CommandClass::Quick)
                .await
                .unwrap_err();
            assert!(err.is_link_fatal());
        }
        assert!(!board.open_state());
        assert!(!session.is_connected());
        assert!(matches!(
            session.lease("probe"),
            Err(LinkError::NotConnected(_))
        ));

        session.update_state(|s| s.exchanges = 9);
        session
            .reconnect(Box::new(MockTransport::new("mock-session").respond("_V!", "_V2!")))
            .unwrap();
        assert!(session.is_connected());
        assert_eq!(session.state().exchanges, 0);

        let mut lease = session.lease("probe").unwrap();
        let frame = lease
            .exchange(&Command::new("V"), CommandClass::Quick)
            .await
            .unwrap();
        assert_eq!(frame.token(0).unwrap(), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_session_and_releases_lease() {
        let board = MockTransport::new("mock-session");
        let session = session(&board);

        {
            let mut lease = session.lease("probe").unwrap();
            let err = lease
                .exchange(&Command::new("G"), CommandClass::Quick)
                .await
                .unwrap_err();
            assert!(err.is_timeout());
        }
        assert!(session.is_connected());
        assert!(session.lease("next").is_ok());
    }

    #[tokio::test]
    async fn disconnect_closes_transport() {
        let board = MockTransport::new("mock-session");
        let session = session(&board);
        session.disconnect().await.unwrap();
        assert!(!board.open_state());
        assert!(!session.status().is_connected());
    }
}
