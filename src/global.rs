//! Flat process-wide API over an implicit [`Runtime`] handle.
//!
//! [`initialize`] acquires the handle and [`destroy`] releases it. In between,
//! [`find`], [`receive`], [`send`] and [`routing`] create sessions without a
//! runtime argument. Sessions keep the engine running after [`destroy`]; only
//! the creation of new sessions is refused.
//!
//! ```no_run
//! use grafton_av::{global, FinderOptions};
//!
//! # async fn run() -> Result<(), grafton_av::Error> {
//! if global::initialize() {
//!     for source in global::find(&FinderOptions::default()).await? {
//!         println!("{source}");
//!     }
//!     global::destroy();
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    Error, Finder, FinderOptions, Receiver, ReceiverOptions, Result, RoutingOptions,
    RoutingProxy, Runtime, Sender, SenderOptions, Source,
};

/// How long [`find`] waits when nothing has been discovered yet.
const FIND_WAIT: Duration = Duration::from_millis(500);

static IMPLICIT: Lazy<Mutex<Option<Runtime>>> = Lazy::new(|| Mutex::new(None));

/// Starts the engine for the flat API. Idempotent.
///
/// Returns false on an unsupported platform or if the engine cannot start.
pub fn initialize() -> bool {
    let mut implicit = IMPLICIT.lock();
    if implicit.is_some() {
        return true;
    }
    match Runtime::new() {
        Ok(runtime) => {
            *implicit = Some(runtime);
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "initialize failed");
            false
        }
    }
}

/// Releases the flat API's handle. Returns whether one was held.
pub fn destroy() -> bool {
    let runtime = IMPLICIT.lock().take();
    runtime.is_some()
}

pub fn is_supported_cpu() -> bool {
    Runtime::is_supported_cpu()
}

/// `Some("grafton-av <version>")`, or `None` on an unsupported platform.
pub fn version() -> Option<&'static str> {
    is_supported_cpu().then(Runtime::version)
}

/// Sources currently visible with `options`, waiting briefly if none have
/// been discovered yet. Empty on an unsupported platform.
///
/// # Errors
///
/// [`Error::NotInitialized`] outside [`initialize`]/[`destroy`].
pub async fn find(options: &FinderOptions) -> Result<Vec<Source>> {
    if !is_supported_cpu() {
        return Ok(Vec::new());
    }
    let finder = Finder::new(&implicit()?, options)?;
    Ok(finder.sources(FIND_WAIT).await)
}

/// Creates a [`Receiver`] on the flat API's runtime.
///
/// # Errors
///
/// [`Error::PlatformUnsupported`], [`Error::NotInitialized`], or whatever
/// [`Receiver::new`] returns.
pub fn receive(options: &ReceiverOptions) -> Result<Receiver> {
    Receiver::new(&implicit()?, options)
}

/// Creates a [`Sender`] on the flat API's runtime.
pub fn send(options: &SenderOptions) -> Result<Sender> {
    Sender::new(&implicit()?, options)
}

/// Creates a [`RoutingProxy`] on the flat API's runtime.
pub fn routing(options: &RoutingOptions) -> Result<RoutingProxy> {
    RoutingProxy::new(&implicit()?, options)
}

fn implicit() -> Result<Runtime> {
    if !is_supported_cpu() {
        return Err(Error::PlatformUnsupported);
    }
    IMPLICIT.lock().clone().ok_or(Error::NotInitialized)
}
