//! Handling of failures the process cannot continue from.

use std::io::Write;

use log::error;

use crate::error::{Error, Result};

const SHUTDOWN_MESSAGE: &str =
    "Unrecoverable failure of the write path, shutting down. Manual intervention is required";

/// Ends the process after a catastrophic failure
pub trait Terminator: Send + Sync {
    fn terminate(&self, err: &Error) -> !;
}

/// Logs the failure, flushes the log sinks and exits with status 1
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, err: &Error) -> ! {
        error!("{}: {}", SHUTDOWN_MESSAGE, err);
        log::logger().flush();
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "{}: {}", SHUTDOWN_MESSAGE, err);
        let _ = stderr.flush();
        std::process::exit(1)
    }
}

/// Unwrap `result`, terminating through `terminator` on failure
pub fn critical<T>(terminator: &dyn Terminator, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => terminator.terminate(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panicking;

    impl Terminator for Panicking {
        fn terminate(&self, err: &Error) -> ! {
            panic!("terminated: {}", err)
        }
    }

    #[test]
    fn test_critical_passes_values_through() {
        assert_eq!(critical(&Panicking, Ok(3)), 3);
    }

    #[test]
    #[should_panic(expected = "terminated: IO error")]
    fn test_critical_terminates_on_error() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        critical::<()>(&Panicking, Err(Error::Io(err)));
    }
}
