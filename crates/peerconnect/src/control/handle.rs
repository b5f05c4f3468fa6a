//! Thread-safe handle to a running control loop

use super::observer::ControlObserver;
use super::task::Task;
use super::{Control, ControlStatus};
use crate::config::{Credentials, PeerConnectConfig};
use crate::engine::EngineFactory;
use crate::queue::{message_queue, QueueSender};
use crate::signal::{SignalChannel, SignalConnector};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

impl Control {
    /// Start a control instance
    ///
    /// Spawns the owning context on a dedicated thread with its own tokio
    /// runtime, and the signal channel on another. `observer` is held
    /// weakly; keep it alive for as long as it should receive events.
    pub fn spawn<O>(
        config: PeerConnectConfig,
        connector: Arc<dyn SignalConnector>,
        engines: Arc<dyn EngineFactory>,
        observer: &Arc<O>,
    ) -> Result<ControlHandle>
    where
        O: ControlObserver + 'static,
    {
        config.validate()?;

        let (queue, tasks) = message_queue::<Task>();
        let signal = SignalChannel::start(
            config.signal.clone(),
            connector,
            Arc::new(queue.clone()),
        )?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let sync_send_timeout = config.peer.sync_send_timeout();
        let mut control = Control::new(config, Box::new(signal), engines, queue.clone());
        let weak: Weak<dyn ControlObserver> = Arc::downgrade(observer) as Weak<dyn ControlObserver>;
        control.observers.register(weak);

        let thread = thread::Builder::new()
            .name("peerconnect-control".to_string())
            .spawn(move || {
                runtime.block_on(control.run(tasks));
                debug!("Control thread exiting");
            })?;

        info!("Control started");

        Ok(ControlHandle {
            inner: Arc::new(HandleInner {
                queue,
                thread: Mutex::new(Some(thread)),
                sync_send_timeout,
            }),
        })
    }
}

struct HandleInner {
    queue: QueueSender<Task>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    sync_send_timeout: Duration,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.queue.post(Task::Shutdown);
    }
}

/// Cloneable handle to a running control instance
///
/// Every method may be called from any thread. Requests are queued to the
/// owning context and return immediately unless documented otherwise.
/// Dropping the last handle stops the control loop.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<HandleInner>,
}

impl ControlHandle {
    /// Sign in and create the `alias` channel so other peers can reach this session
    pub fn sign_in(&self, user_id: &str, user_password: &str, alias: &str) {
        self.sign_in_with(
            Credentials {
                user_id: user_id.to_string(),
                user_password: user_password.to_string(),
            },
            alias,
        );
    }

    /// Sign in with credentials from a settings document
    pub fn sign_in_with(&self, credentials: Credentials, alias: &str) {
        self.post(Task::SignIn {
            credentials,
            alias: alias.to_string(),
        });
    }

    /// Disconnect every peer and close the signal channel
    ///
    /// Completion is reported through `on_signed_out`.
    pub fn sign_out(&self) {
        self.post(Task::SignOut);
    }

    /// Connect to the peer that signed in as `remote_id`
    pub fn connect(&self, remote_id: &str) {
        self.post(Task::Connect(remote_id.to_string()));
    }

    /// Disconnect from `remote_id`
    pub fn disconnect(&self, remote_id: &str) {
        self.post(Task::Disconnect(remote_id.to_string()));
    }

    /// Queue bytes for a peer without waiting for them to be flushed
    pub async fn send(&self, remote_id: &str, data: impl Into<Bytes>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Task::Send {
            remote_id: remote_id.to_string(),
            data: data.into(),
            reply,
        });
        rx.await.map_err(|_| Error::ControlStopped)?
    }

    /// Send bytes and block until the peer's buffer has drained
    ///
    /// Blocks the calling thread for up to the configured sync-send timeout.
    /// Refuses to run on the owning context, which must keep running for
    /// the drain to be observed. From async code, call it through
    /// `tokio::task::spawn_blocking`.
    pub fn sync_send(&self, remote_id: &str, data: impl Into<Bytes>) -> Result<()> {
        if self.inner.queue.is_owning_context() {
            return Err(Error::OwningContext(format!("sync_send to {}", remote_id)));
        }

        let (reply, rx) = oneshot::channel();
        self.post(Task::OpenWriter {
            remote_id: remote_id.to_string(),
            reply,
        });
        let writer = futures::executor::block_on(rx).map_err(|_| Error::ControlStopped)??;

        writer.sync_send(data.into(), self.inner.sync_send_timeout)
    }

    /// Queue bytes for every open peer; returns how many peers accepted them
    pub async fn broadcast(&self, data: impl Into<Bytes>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.post(Task::Broadcast {
            data: data.into(),
            reply,
        });
        rx.await.map_err(|_| Error::ControlStopped)
    }

    /// Snapshot of the session and peer table
    pub async fn status(&self) -> Result<ControlStatus> {
        let (reply, rx) = oneshot::channel();
        self.post(Task::Status(reply));
        rx.await.map_err(|_| Error::ControlStopped)
    }

    /// Add an observer; it is held weakly
    pub fn register_observer<O>(&self, observer: &Arc<O>)
    where
        O: ControlObserver + 'static,
    {
        let weak: Weak<dyn ControlObserver> = Arc::downgrade(observer) as Weak<dyn ControlObserver>;
        self.post(Task::RegisterObserver(weak));
    }

    pub fn unregister_observer<O>(&self, observer: &Arc<O>)
    where
        O: ControlObserver + 'static,
    {
        let weak: Weak<dyn ControlObserver> = Arc::downgrade(observer) as Weak<dyn ControlObserver>;
        self.post(Task::UnregisterObserver(weak));
    }

    /// True when called on the control loop's thread
    pub fn is_owning_context(&self) -> bool {
        self.inner.queue.is_owning_context()
    }

    /// Stop the control loop, release every peer and stop the signal channel
    ///
    /// Waits for the control thread unless called from it.
    pub fn shutdown(&self) {
        self.post(Task::Shutdown);

        let Some(handle) = self.inner.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Control thread panicked");
        }
    }

    fn post(&self, task: Task) {
        if self.inner.queue.is_closed() {
            debug!(?task, "Control stopped, dropping request");
            return;
        }
        self.inner.queue.post(task);
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("stopped", &self.inner.queue.is_closed())
            .finish()
    }
}
