//! Human-in-the-loop confirmation gate.

use super::types::FixAction;

/// Decides whether an action that requires confirmation may proceed.
///
/// Called synchronously, once per action, before any backup is taken.
pub trait ConfirmPolicy: Send + Sync {
    fn confirm(&self, action: &FixAction) -> bool;
}

/// Approves every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ConfirmPolicy for AutoApprove {
    fn confirm(&self, _action: &FixAction) -> bool {
        true
    }
}

/// Rejects every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl ConfirmPolicy for DenyAll {
    fn confirm(&self, _action: &FixAction) -> bool {
        false
    }
}

impl<F> ConfirmPolicy for F
where
    F: Fn(&FixAction) -> bool + Send + Sync,
{
    fn confirm(&self, action: &FixAction) -> bool {
        self(action)
    }
}
