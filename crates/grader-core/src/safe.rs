//! Safe environment: fault capture with recovery and hard-failure escalation.
//!
//! A fault is either an `Err` returned by a callback or a panic raised
//! inside it. The caller-supplied handler decides whether the run can go
//! on: `Ok(Some(value))` means "handled" and `value` becomes the result;
//! anything else (declining with `Ok(None)`, failing, or panicking) turns
//! the fault into a [`HardFailure`] that ends the whole run.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, warn};

/// Apology written to the report when a fault cannot be recovered.
pub const UNEXPECTED_FAILURE_MESSAGE: &str = "An unexpected error occurred while trying to \
     execute the grader. Please try again or contact a course staff member if this persists.";

/// An uncaught fault raised by a callback.
#[derive(Debug)]
pub enum Fault {
    /// The callback returned an error.
    Error(anyhow::Error),
    /// The callback panicked; holds the panic message.
    Panic(String),
}

impl Fault {
    /// Downcast the underlying error, if this fault carries one of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Fault::Error(err) => err.downcast_ref::<E>(),
            Fault::Panic(_) => None,
        }
    }

    /// Whether the fault was a panic rather than a returned error.
    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic(_))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(err) => write!(f, "{:#}", err),
            Fault::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// Unrecoverable failure: the run must stop and report a zero score.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("hard failure: {cause}")]
pub struct HardFailure {
    /// User-facing message written to the failure report.
    pub message: String,
    /// Internal description of what went wrong (logged, never reported).
    pub cause: String,
}

impl HardFailure {
    pub fn new(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: cause.into(),
        }
    }
}

/// Run `fut`, converting a returned error or a panic into a [`Fault`].
pub async fn capture<F, T>(fut: F) -> Result<T, Fault>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Fault::Error(err)),
        Err(payload) => Err(Fault::Panic(panic_message(payload.as_ref()))),
    }
}

/// Hand `fault` to `handler`; escalate if the handler cannot recover.
pub fn recover<T, H>(fault: Fault, handler: H) -> Result<T, HardFailure>
where
    H: FnOnce(&Fault) -> anyhow::Result<Option<T>>,
{
    error!(event = "safe.fault", fault = %fault, "fault caught in safe environment");

    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&fault))) {
        Ok(Ok(Some(value))) => Ok(value),
        Ok(Ok(None)) => {
            warn!(event = "safe.declined", fault = %fault, "fault handler could not recover");
            Err(escalate(&fault))
        }
        Ok(Err(err)) => {
            error!(event = "safe.handler_failed", error = %err, "fault handler failed");
            Err(escalate(&fault))
        }
        Err(payload) => {
            error!(
                event = "safe.handler_panicked",
                panic = %panic_message(payload.as_ref()),
                "fault handler panicked"
            );
            Err(escalate(&fault))
        }
    }
}

/// Turn a fault into a [`HardFailure`] without attempting recovery.
pub fn escalate(fault: &Fault) -> HardFailure {
    HardFailure::new(UNEXPECTED_FAILURE_MESSAGE, fault.to_string())
}

/// Run `fut` inside the safe environment with a recovery `handler`.
pub async fn safe<F, T, H>(fut: F, handler: H) -> Result<T, HardFailure>
where
    F: Future<Output = anyhow::Result<T>>,
    H: FnOnce(&Fault) -> anyhow::Result<Option<T>>,
{
    match capture(fut).await {
        Ok(value) => Ok(value),
        Err(fault) => recover(fault, handler),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
