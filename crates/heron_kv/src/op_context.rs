//! Operation-scoped context: the current recovery unit plus interruption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use heron_common::error::{Error, Result};

use crate::recovery_unit::RecoveryUnit;

/// Carries one operation's recovery unit. The unit is held in an `Option` so
/// retention can temporarily swap in a fresh sub-unit and restore the
/// original on every exit path.
pub struct OperationContext {
    recovery_unit: Option<RecoveryUnit>,
    interrupted: Arc<AtomicBool>,
}

impl OperationContext {
    pub fn new(recovery_unit: RecoveryUnit) -> Self {
        Self {
            recovery_unit: Some(recovery_unit),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn recovery_unit(&mut self) -> &mut RecoveryUnit {
        self.recovery_unit
            .as_mut()
            .expect("operation context has no recovery unit")
    }

    /// Take the unit out of the context (retention sub-unit swap).
    pub fn release_recovery_unit(&mut self) -> RecoveryUnit {
        self.recovery_unit
            .take()
            .expect("operation context has no recovery unit")
    }

    pub fn set_recovery_unit(&mut self, recovery_unit: RecoveryUnit) {
        self.recovery_unit = Some(recovery_unit);
    }

    /// Handle another thread can flip to interrupt this operation's waits.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn check_for_interrupt(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}
