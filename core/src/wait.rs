//! Waiting for process exit without parking a thread
//!
//! A process exposes a [`WaitPrimitive`]: a Linux pidfd for directly spawned
//! children, or an [`ExitEvent`] set by the helper's notification reader.
//! [`ExitWaitScheduler::wait_async`] races that primitive against an
//! optional timeout and a [`CancellationToken`]. The outcome is decided
//! exactly once and an observable exit always wins over a timeout or
//! cancellation that fires at the same moment.

use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// One-shot, in-process "the process exited" signal usable from both async
/// and blocking code
#[derive(Debug, Default)]
pub struct ExitEvent {
    set: Mutex<bool>,
    cond: Condvar,
    notify: Notify,
}

impl ExitEvent {
    /// Create an unset event
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake every waiter. Setting twice is harmless.
    pub fn set(&self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        *set = true;
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    /// Whether the event has been set
    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Resolve once the event is set
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent set() is not missed
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Block the current thread until the event is set or `timeout` elapses.
    /// Returns whether the event is set.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> bool {
        let guard = self.set.lock().unwrap_or_else(|p| p.into_inner());
        match timeout {
            None => {
                let guard = self
                    .cond
                    .wait_while(guard, |set| !*set)
                    .unwrap_or_else(|p| p.into_inner());
                *guard
            }
            Some(timeout) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |set| !*set)
                    .unwrap_or_else(|p| p.into_inner());
                *guard
            }
        }
    }
}

/// What a waiter can block on
#[derive(Debug)]
pub enum WaitPrimitive {
    /// Linux process descriptor; readable once the process has exited
    PidFd(OwnedFd),
    /// Set by the notification reader
    Event(Arc<ExitEvent>),
}

impl WaitPrimitive {
    /// Zero-timeout check
    pub fn is_signaled(&self) -> bool {
        match self {
            WaitPrimitive::PidFd(fd) => poll_pidfd(fd, PollTimeout::ZERO).unwrap_or(false),
            WaitPrimitive::Event(event) => event.is_set(),
        }
    }

    /// Resolve once the primitive is signaled
    pub async fn signaled(&self) -> Result<()> {
        match self {
            WaitPrimitive::PidFd(fd) => {
                let dup = fd.try_clone()?;
                let async_fd = AsyncFd::new(dup)?;
                let _guard = async_fd.readable().await?;
                Ok(())
            }
            WaitPrimitive::Event(event) => {
                event.wait().await;
                Ok(())
            }
        }
    }

    /// Block until signaled or `timeout` elapses; returns whether signaled
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Result<bool> {
        match self {
            WaitPrimitive::PidFd(fd) => {
                let deadline = timeout.map(|t| Instant::now() + t);
                loop {
                    let poll_timeout = match deadline {
                        None => PollTimeout::NONE,
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            let ms = remaining.as_millis().min(i32::MAX as u128) as i32;
                            PollTimeout::try_from(ms).unwrap_or(PollTimeout::NONE)
                        }
                    };
                    match poll_pidfd(fd, poll_timeout) {
                        Ok(true) => return Ok(true),
                        Ok(false) => {
                            if deadline.map_or(false, |d| Instant::now() >= d) {
                                return Ok(false);
                            }
                        }
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            return Err(CoreError::ProcessWait(format!("poll on pidfd: {e}")))
                        }
                    }
                }
            }
            WaitPrimitive::Event(event) => Ok(event.wait_blocking(timeout)),
        }
    }
}

fn poll_pidfd(fd: &OwnedFd, timeout: PollTimeout) -> std::result::Result<bool, Errno> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    let ready = poll(&mut fds, timeout)?;
    Ok(ready > 0)
}

/// Process-side hooks the scheduler needs
pub trait ExitSource: Send + Sync {
    /// Whether an exit code has already been recorded
    fn has_exited(&self) -> bool;

    /// The primitive to wait on
    fn primitive(&self) -> &WaitPrimitive;

    /// The primitive is signaled; record the exit code if not done yet, or
    /// fail if it can no longer be known
    fn observe_exit(&self) -> Result<()>;
}

enum Outcome {
    Exited(Result<()>),
    TimedOut,
    Canceled,
}

struct Registration<'a>(&'a AtomicU64);

impl<'a> Registration<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatches exit waits; counts the waits currently registered
#[derive(Debug, Default)]
pub struct ExitWaitScheduler {
    registrations: AtomicU64,
}

impl ExitWaitScheduler {
    /// Create a scheduler with no registrations
    pub const fn new() -> Self {
        Self {
            registrations: AtomicU64::new(0),
        }
    }

    /// Number of waits currently registered
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Wait for `source` to exit.
    ///
    /// Returns `Ok(true)` on exit, `Ok(false)` when `timeout` elapsed and
    /// [`CoreError::Canceled`] when `cancel` fired first. `None` waits
    /// forever. A source that cannot produce an exit code (its helper died)
    /// fails from [`ExitSource::observe_exit`].
    pub async fn wait_async(
        &self,
        source: &dyn ExitSource,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if source.has_exited() {
            return Ok(true);
        }
        if source.primitive().is_signaled() {
            source.observe_exit()?;
            return Ok(true);
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Canceled);
        }

        let outcome = {
            let _registration = Registration::new(&self.registrations);
            trace!("Registered exit wait ({} active)", self.registrations());
            let deadline = async {
                match timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                result = source.primitive().signaled() => Outcome::Exited(result),
                _ = cancel.cancelled() => Outcome::Canceled,
                _ = deadline => Outcome::TimedOut,
            }
        };

        match outcome {
            Outcome::Exited(result) => {
                result?;
                source.observe_exit()?;
                Ok(true)
            }
            Outcome::TimedOut | Outcome::Canceled
                if source.has_exited() || source.primitive().is_signaled() =>
            {
                source.observe_exit()?;
                Ok(true)
            }
            Outcome::TimedOut => Ok(false),
            Outcome::Canceled => Err(CoreError::Canceled),
        }
    }

    /// Blocking counterpart of [`wait_async`](Self::wait_async) without
    /// cancellation
    pub fn wait_blocking(&self, source: &dyn ExitSource, timeout: Option<Duration>) -> Result<bool> {
        if source.has_exited() {
            return Ok(true);
        }
        let _registration = Registration::new(&self.registrations);
        if source.primitive().wait_blocking(timeout)? {
            source.observe_exit()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeSource {
        primitive: WaitPrimitive,
        exited: AtomicBool,
        observed: AtomicU64,
    }

    impl FakeSource {
        fn new() -> (Arc<Self>, Arc<ExitEvent>) {
            let event = Arc::new(ExitEvent::new());
            let source = Arc::new(Self {
                primitive: WaitPrimitive::Event(Arc::clone(&event)),
                exited: AtomicBool::new(false),
                observed: AtomicU64::new(0),
            });
            (source, event)
        }
    }

    impl ExitSource for FakeSource {
        fn has_exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }
        fn primitive(&self) -> &WaitPrimitive {
            &self.primitive
        }
        fn observe_exit(&self) -> Result<()> {
            self.observed.fetch_add(1, Ordering::SeqCst);
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exited_resolves_without_registering() {
        let scheduler = ExitWaitScheduler::new();
        let (source, _event) = FakeSource::new();
        source.exited.store(true, Ordering::SeqCst);
        let ok = scheduler
            .wait_async(source.as_ref(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(scheduler.registrations(), 0);
        assert_eq!(source.observed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signaled_primitive_caches_exit() {
        let scheduler = ExitWaitScheduler::new();
        let (source, event) = FakeSource::new();
        event.set();
        assert!(scheduler
            .wait_async(source.as_ref(), Some(Duration::ZERO), &CancellationToken::new())
            .await
            .unwrap());
        assert_eq!(source.observed.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.registrations(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_exit() {
        let scheduler = ExitWaitScheduler::new();
        let (source, _event) = FakeSource::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scheduler
            .wait_async(source.as_ref(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Canceled));
        assert_eq!(scheduler.registrations(), 0);
    }

    #[tokio::test]
    async fn test_exit_before_cancel_wins() {
        let scheduler = ExitWaitScheduler::new();
        let (source, event) = FakeSource::new();
        let cancel = CancellationToken::new();
        event.set();
        cancel.cancel();
        assert!(scheduler
            .wait_async(source.as_ref(), None, &cancel)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let scheduler = Arc::new(ExitWaitScheduler::new());
        let (source, _event) = FakeSource::new();
        let cancel = CancellationToken::new();

        let task = {
            let scheduler = Arc::clone(&scheduler);
            let source = Arc::clone(&source);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.wait_async(source.as_ref(), None, &cancel).await })
        };
        while scheduler.registrations() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(CoreError::Canceled)));
        assert_eq!(scheduler.registrations(), 0);
    }

    #[tokio::test]
    async fn test_exit_while_waiting() {
        let scheduler = Arc::new(ExitWaitScheduler::new());
        let (source, event) = FakeSource::new();

        let task = {
            let scheduler = Arc::clone(&scheduler);
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                scheduler
                    .wait_async(source.as_ref(), Some(Duration::from_secs(30)), &CancellationToken::new())
                    .await
            })
        };
        while scheduler.registrations() == 0 {
            tokio::task::yield_now().await;
        }
        event.set();
        assert!(task.await.unwrap().unwrap());
        assert_eq!(scheduler.registrations(), 0);
        assert!(source.has_exited());
    }

    #[tokio::test]
    async fn test_timeout() {
        let scheduler = ExitWaitScheduler::new();
        let (source, _event) = FakeSource::new();
        let exited = scheduler
            .wait_async(source.as_ref(), Some(Duration::from_millis(20)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!exited);
        assert_eq!(scheduler.registrations(), 0);
    }

    #[test]
    fn test_blocking_wait_on_event() {
        let scheduler = ExitWaitScheduler::new();
        let (source, event) = FakeSource::new();
        assert!(!scheduler
            .wait_blocking(source.as_ref(), Some(Duration::from_millis(10)))
            .unwrap());

        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            event.set();
        });
        assert!(scheduler.wait_blocking(source.as_ref(), None).unwrap());
        setter.join().unwrap();
        assert_eq!(scheduler.registrations(), 0);
    }

    #[tokio::test]
    async fn test_event_wakes_many_waiters() {
        let event = Arc::new(ExitEvent::new());
        let mut waiters = Vec::new();
        for _ in 0..16 {
            let event = Arc::clone(&event);
            waiters.push(tokio::spawn(async move { event.wait().await }));
        }
        tokio::task::yield_now().await;
        event.set();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(5), w)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(event.wait_blocking(Some(Duration::ZERO)));
    }
}
