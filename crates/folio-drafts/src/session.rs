//! Edit-mode capability.
//!
//! Editing is only possible while an [`EditSession`] is active. Fields and
//! workspace operations take the current [`EditMode`] explicitly instead of
//! reading a global flag.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditMode(bool);

impl EditMode {
    pub const ENABLED: EditMode = EditMode(true);
    pub const DISABLED: EditMode = EditMode(false);

    pub fn is_enabled(&self) -> bool {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct EditSession {
    active: AtomicBool,
}

impl EditSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn end(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn mode(&self) -> EditMode {
        EditMode(self.active.load(Ordering::SeqCst))
    }
}
