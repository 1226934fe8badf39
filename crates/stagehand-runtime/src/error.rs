use std::fmt;

/// Marker error produced when a script evaluation is halted through its
/// task's interrupt rather than by a fault in the script itself.
///
/// Runners treat this as a clean stop: no crash is recorded and the task is
/// not disabled.
#[derive(Copy, Clone, Debug, Default)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script evaluation was interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Check whether an error chain was caused by an interrupt.
pub(crate) fn is_interrupted(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|e| e.downcast_ref::<Interrupted>().is_some())
}
