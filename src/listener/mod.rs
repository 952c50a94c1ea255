//! Running network listeners.
//!
//! Both the peer WebSocket listener and the MCP front-end are axum routers
//! served on an already-bound [`TcpListener`]. A [`ListenerHandle`] stops
//! one of them: it flips a shutdown flag that the server and every
//! long-lived connection (peer socket, SSE stream) watch, then waits for the
//! serving task to finish.

pub mod peer;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long [`ListenerHandle::stop`] waits before aborting the server task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Receiving side of a listener's shutdown flag.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Resolves once the shutdown flag is raised (or its sender is gone).
pub async fn wait_for_shutdown(mut signal: ShutdownSignal) {
    let _ = signal.wait_for(|stop| *stop).await;
}

/// A listener serving in the background.
#[derive(Debug)]
pub struct ListenerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `true` until [`stop`](Self::stop) completes or the server exits.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the listener. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        self.shutdown.send_replace(true);

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!(listener = self.name, "Listener did not stop in time, aborting");
            task.abort();
        }
        info!(listener = self.name, addr = %self.local_addr, "Listener stopped");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Serves `app` on `listener` until the handle is stopped.
///
/// `app` is built by `make_app` from the shutdown signal so its handlers can
/// end their own long-lived connections.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub fn spawn_router<F>(name: &'static str, listener: TcpListener, make_app: F) -> io::Result<ListenerHandle>
where
    F: FnOnce(ShutdownSignal) -> Router,
{
    let local_addr = listener.local_addr()?;
    let (shutdown, signal) = watch::channel(false);
    let app = make_app(signal.clone());

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(wait_for_shutdown(signal))
            .await;

        match result {
            Ok(()) => debug!(listener = name, "Server loop finished"),
            Err(e) => error!(listener = name, error = %e, "Server loop failed"),
        }
    });

    info!(listener = name, addr = %local_addr, "Listener started");

    Ok(ListenerHandle {
        name,
        local_addr,
        shutdown,
        task: Some(task),
    })
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    #[tokio::test]
    async fn stop_releases_the_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut handle = spawn_router("test", listener, |_| {
            Router::new().route("/", get(|| async { "ok" }))
        })
        .unwrap();
        let addr = handle.local_addr();
        assert!(handle.is_running());

        handle.stop().await;
        assert!(!handle.is_running());
        std::net::TcpListener::bind(addr).unwrap();

        // idempotent
        handle.stop().await;
    }
}
