//! Handler boundary for messages and periodic tasks.
//!
//! A supervised future runs on its own tokio task. A panic inside it surfaces
//! as a `JoinError`, which is turned into [`ControllerError::Panic`]; together
//! with deadline overruns and ordinary errors it is logged and sent to the
//! alerter, and the caller gets a plain `Err` back instead of an unwinding
//! consumer loop.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;

use crate::alerting::{AlertData, Alerter};
use crate::error::{ControllerError, Result};

/// Run `fut` behind a panic and deadline boundary, reporting failures.
pub async fn supervise<T, F>(
    context: &str,
    deadline: Duration,
    alerter: &dyn Alerter,
    data: AlertData,
    fut: F,
) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();

    let result = match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(panic_to_error(context, join_err)),
        Err(_) => {
            abort.abort();
            Err(ControllerError::DeadlineExceeded {
                operation: "handler",
                after: deadline,
            })
        }
    };

    if let Err(e) = &result {
        tracing::error!(context, error = %e, "Handler failed");
        alerter.send_alert(e, data);
    }

    result
}

/// Convert a failed join into an error carrying the panic message, if any.
pub fn panic_to_error(context: &str, err: JoinError) -> ControllerError {
    if !err.is_panic() {
        return ControllerError::Internal(format!("{} was cancelled", context));
    }

    let payload = err.into_panic();
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };

    ControllerError::Panic {
        context: context.to_string(),
        message,
    }
}
