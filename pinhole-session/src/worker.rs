//! Optional worker-thread mode: the worker owns the session behind one
//! mutex and calls `update()` at the configured cadence; every external
//! entry point takes the same mutex for its full duration.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

use pinhole_core::{PathKind, Result, SessionState};

use crate::session::Session;

/// A session driven by an internal update thread.
pub struct SessionWorker {
    inner: Arc<Mutex<Session>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Take ownership of a session and start ticking it.
    pub fn spawn(session: Session) -> Self {
        let interval = Duration::from_millis(session.config_update_interval_ms().max(1));
        let inner = Arc::new(Mutex::new(session));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_inner = Arc::clone(&inner);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                {
                    let mut session = thread_inner.lock();
                    match session.state() {
                        SessionState::Closed | SessionState::Error => break,
                        _ => {
                            let _ = session.update();
                        }
                    }
                }
                std::thread::sleep(interval);
            }
            debug!("session worker stopped");
        });

        Self {
            inner,
            stop,
            handle: Some(handle),
        }
    }

    pub fn connect(&self, remote: Option<&str>) -> Result<()> {
        self.inner.lock().connect(remote)
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.inner.lock().send(data)
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().recv(buf)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state()
    }

    pub fn path(&self) -> PathKind {
        self.inner.lock().path()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().is_ready()
    }

    /// Close the session and join the worker thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.inner.lock().close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}
