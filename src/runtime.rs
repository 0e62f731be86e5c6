//! Runtime management and initialization.

use std::{
    future::Future,
    pin::{pin, Pin},
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::{self, Either};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};

use crate::{discovery::DiscoveryService, Config, Error, Result};

/// The worker threads and the services they run.
pub(crate) struct Engine {
    config: Config,
    handle: Handle,
    discovery: Arc<DiscoveryService>,
    workers: Mutex<Option<tokio::runtime::Runtime>>,
}

impl Engine {
    fn start(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let workers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("grafton-av-worker")
            .enable_all()
            .build()
            .map_err(|e| Error::InitializationFailed(format!("Worker threads: {e}")))?;
        let handle = workers.handle().clone();
        let discovery = DiscoveryService::start(&handle, &config);

        tracing::info!(
            worker_threads = config.worker_threads,
            discovery_port = config.discovery_port,
            multicast = config.multicast_enabled,
            "runtime started"
        );
        Ok(Arc::new(Self {
            config,
            handle,
            discovery,
            workers: Mutex::new(Some(workers)),
        }))
    }

    /// Withdraws local announcements and stops the workers without waiting
    /// for them, so it may run inside an async context.
    fn shutdown(&self) {
        if let Some(workers) = self.workers.lock().take() {
            self.discovery.stop();
            workers.shutdown_background();
            tracing::info!("runtime stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State of the runtime lifecycle.
enum State {
    /// Runtime has not been initialized yet.
    Uninitialized,
    /// Runtime is currently being initialized by another thread.
    Initializing,
    /// Runtime is running with the given number of handles.
    Initialized {
        refcount: usize,
        engine: Arc<Engine>,
    },
    /// Runtime is currently being torn down.
    Destroying,
}

/// Process-global runtime manager.
struct RuntimeManager {
    state: Mutex<State>,
    cv: Condvar,
}

impl RuntimeManager {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Uninitialized),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self, config: impl FnOnce() -> Config) -> Result<Arc<Engine>> {
        let mut state = self.state.lock();
        loop {
            if let State::Initialized { refcount, engine } = &mut *state {
                *refcount += 1;
                return Ok(engine.clone());
            }
            if matches!(*state, State::Initializing | State::Destroying) {
                self.cv.wait(&mut state);
                continue;
            }

            // We'll be the initializer
            *state = State::Initializing;
            let started = MutexGuard::unlocked(&mut state, || Engine::start(config()));
            let result = match started {
                Ok(engine) => {
                    *state = State::Initialized {
                        refcount: 1,
                        engine: engine.clone(),
                    };
                    Ok(engine)
                }
                Err(e) => {
                    tracing::error!(error = %e, "runtime failed to start");
                    *state = State::Uninitialized;
                    Err(e)
                }
            };
            self.cv.notify_all();
            return result;
        }
    }

    fn retain(&self) {
        if let State::Initialized { refcount, .. } = &mut *self.state.lock() {
            *refcount += 1;
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Destroying) {
            State::Initialized { refcount, engine } if refcount > 1 => {
                *state = State::Initialized {
                    refcount: refcount - 1,
                    engine,
                };
            }
            State::Initialized { engine, .. } => {
                // Last reference, tear the engine down
                MutexGuard::unlocked(&mut state, || engine.shutdown());
                *state = State::Uninitialized;
                self.cv.notify_all();
            }
            other => {
                *state = other;
                tracing::error!("runtime released more often than it was acquired");
            }
        }
    }

    fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Initialized { .. })
    }
}

static RUNTIME: Lazy<RuntimeManager> = Lazy::new(RuntimeManager::new);

/// Handle to the process-wide transport runtime.
///
/// The first handle starts the worker threads and the discovery service;
/// further handles share them. When the last handle is dropped the runtime
/// withdraws every local announcement and shuts down. Every session keeps a
/// handle of its own, so the runtime outlives the handle used to create it.
///
/// # Examples
///
/// ```no_run
/// use grafton_av::Runtime;
///
/// # fn main() -> Result<(), grafton_av::Error> {
/// let runtime = Runtime::new()?;
///
/// // The runtime stays alive as long as any handle exists
/// let runtime2 = runtime.clone(); // Cheap reference-counted clone
/// # Ok(())
/// # }
/// ```
pub struct Runtime {
    engine: Arc<Engine>,
}

impl Runtime {
    /// Acquires the runtime, starting it with [`Config::from_env`] if it is
    /// not running.
    ///
    /// # Errors
    ///
    /// [`Error::PlatformUnsupported`] if [`Runtime::is_supported_cpu`] is
    /// false, [`Error::InitializationFailed`] if the worker threads cannot be
    /// started.
    pub fn new() -> Result<Self> {
        Self::acquire(Config::from_env)
    }

    /// Acquires the runtime, starting it with `config` if it is not running.
    ///
    /// A runtime that is already running keeps its configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        Self::acquire(move || config)
    }

    fn acquire(config: impl FnOnce() -> Config) -> Result<Self> {
        if !Self::is_supported_cpu() {
            return Err(Error::PlatformUnsupported);
        }
        let engine = RUNTIME.acquire(config)?;
        Ok(Self { engine })
    }

    /// Whether this platform and CPU can run the transport.
    ///
    /// Linux and macOS are supported on any architecture, Windows on x86 and
    /// x86-64. x86 CPUs need SSE4.2.
    ///
    /// ```
    /// if grafton_av::Runtime::is_supported_cpu() {
    ///     println!("CPU is supported");
    /// }
    /// ```
    pub fn is_supported_cpu() -> bool {
        platform_supported() && cpu_supported()
    }

    /// Library name and version, e.g. `"grafton-av 0.1.0"`.
    pub fn version() -> &'static str {
        concat!("grafton-av ", env!("CARGO_PKG_VERSION"))
    }

    /// Checks if the runtime is currently started.
    pub fn is_running() -> bool {
        RUNTIME.is_running()
    }

    /// The configuration the running engine was started with.
    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.engine.handle
    }

    pub(crate) fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.engine.discovery
    }
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        RUNTIME.retain();
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        RUNTIME.release();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("machine", &self.engine.discovery.machine_name())
            .field("config", &self.engine.config)
            .finish()
    }
}

/// A sleep armed on the engine's timer.
///
/// Public async calls wait through this instead of `tokio::time` so they
/// can be awaited from any executor, not only from inside a tokio runtime.
/// Dropping it cancels the timer task.
pub(crate) struct EngineSleep(JoinHandle<()>);

impl EngineSleep {
    pub(crate) fn until(handle: &Handle, deadline: Instant) -> Self {
        Self(handle.spawn(tokio::time::sleep_until(deadline)))
    }
}

impl Future for EngineSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A cancelled timer (engine shut down) counts as elapsed
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

impl Drop for EngineSleep {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `work` until `deadline` on the engine's timer. Returns `None` if
/// the deadline passed first.
pub(crate) async fn timeout_at<F: Future>(
    handle: &Handle,
    deadline: Instant,
    work: F,
) -> Option<F::Output> {
    let work = pin!(work);
    match future::select(work, EngineSleep::until(handle, deadline)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

/// [`timeout_at`] with a relative timeout. A timeout too large to represent
/// waits forever.
pub(crate) async fn timeout<F: Future>(
    handle: &Handle,
    timeout: Duration,
    work: F,
) -> Option<F::Output> {
    match Instant::now().checked_add(timeout) {
        Some(deadline) => timeout_at(handle, deadline, work).await,
        None => Some(work.await),
    }
}

fn platform_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos"))
        || cfg!(all(
            target_os = "windows",
            any(target_arch = "x86", target_arch = "x86_64")
        ))
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn cpu_supported() -> bool {
    std::is_x86_feature_detected!("sse4.2")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn cpu_supported() -> bool {
    true
}
