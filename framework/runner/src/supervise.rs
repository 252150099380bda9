//! The call boundary around user code: errors are returned, panics are caught with their trace.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Once;

use gust_core::prelude::{ShutdownSignalError, UnitOutcome, WorkerError};

thread_local! {
    static SUPERVISED: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<(String, String)>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

pub(crate) enum Supervised<T> {
    Returned(anyhow::Result<T>),
    Panicked { message: String, trace: String },
}

/// Call `f`, catching a panic and capturing where it came from.
pub(crate) fn supervise<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Supervised<T> {
    install_panic_hook();

    SUPERVISED.with(|depth| depth.set(depth.get() + 1));
    let result = catch_unwind(AssertUnwindSafe(f));
    SUPERVISED.with(|depth| depth.set(depth.get() - 1));

    match result {
        Ok(result) => Supervised::Returned(result),
        Err(payload) => {
            let (message, trace) = LAST_PANIC
                .with(|last| last.borrow_mut().take())
                .unwrap_or_else(|| (payload_message(payload.as_ref()), String::new()));
            Supervised::Panicked { message, trace }
        }
    }
}

impl<T> Supervised<T> {
    /// Errors and panics from a hook become a [WorkerError] naming the stage.
    pub(crate) fn into_hook_result(self, stage: &str) -> Result<T, WorkerError> {
        match self {
            Supervised::Returned(Ok(value)) => Ok(value),
            Supervised::Returned(Err(e)) if e.is::<ShutdownSignalError>() => {
                Err(WorkerError::Canceled)
            }
            Supervised::Returned(Err(e)) => Err(WorkerError::Hook {
                stage: stage.to_string(),
                reason: format!("{e:#}"),
            }),
            Supervised::Panicked { message, trace } => Err(WorkerError::Panicked {
                stage: stage.to_string(),
                message,
                trace,
            }),
        }
    }
}

impl Supervised<()> {
    pub(crate) fn into_outcome(self) -> UnitOutcome {
        match self {
            Supervised::Returned(Ok(())) => UnitOutcome::Passed,
            Supervised::Returned(Err(e)) => UnitOutcome::failed(format!("{e:#}")),
            Supervised::Panicked { message, trace } => UnitOutcome::Panicked { message, trace },
        }
    }
}

fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if SUPERVISED.with(|depth| depth.get()) == 0 {
                previous(info);
                return;
            }

            let mut message = payload_message(info.payload());
            if let Some(location) = info.location() {
                message = format!("{message} at {location}");
            }
            log::debug!("Caught panic: {message}");

            let trace = Backtrace::force_capture().to_string();
            LAST_PANIC.with(|last| *last.borrow_mut() = Some((message, trace)));
        }));
    });
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_is_captured_with_trace() {
        let outcome = supervise(|| -> anyhow::Result<()> { panic!("boom") }).into_outcome();

        match outcome {
            UnitOutcome::Panicked { message, trace } => {
                assert!(message.starts_with("boom at "), "{message}");
                assert!(!trace.is_empty());
            }
            other => panic!("Expected a panic, got {other:?}"),
        }
    }

    #[test]
    fn error_becomes_failure() {
        let outcome = supervise(|| -> anyhow::Result<()> { anyhow::bail!("nope") }).into_outcome();
        assert_eq!(UnitOutcome::failed("nope"), outcome);
    }

    #[test]
    fn hook_errors_name_the_stage() {
        let err = supervise(|| -> anyhow::Result<()> { anyhow::bail!("nope") })
            .into_hook_result("suite setup")
            .unwrap_err();
        assert_eq!(
            WorkerError::Hook {
                stage: "suite setup".to_string(),
                reason: "nope".to_string()
            },
            err
        );

        let err = supervise(|| -> anyhow::Result<()> { Err(ShutdownSignalError::default().into()) })
            .into_hook_result("suite setup")
            .unwrap_err();
        assert_eq!(WorkerError::Canceled, err);
    }
}
