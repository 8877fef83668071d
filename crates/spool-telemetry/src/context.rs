//! Application span guard.

use tracing::{Span, span::Entered};

use crate::init::build_sha;

/// Keeps the application-level span entered for the lifetime of the process.
pub struct GlobalContextGuard {
    _guard: Entered<'static>,
}

impl GlobalContextGuard {
    /// Enter the `app` span carrying the run mode and build SHA.
    #[must_use]
    pub fn new(mode: impl Into<String>) -> Self {
        let mode = mode.into();
        let span: &'static Span = Box::leak(Box::new(
            tracing::info_span!("app", mode = %mode, build_sha = %build_sha()),
        ));
        Self {
            _guard: span.enter(),
        }
    }
}
