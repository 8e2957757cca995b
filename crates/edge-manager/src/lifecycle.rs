//! Start/stop bookkeeping for the supervised components.

use common::{Component, Error, Result};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Guards one running instance of a component loop.
///
/// `begin` hands out a child token of the caller's scope and refuses a second
/// start; `stop` cancels that token.
pub(crate) struct Lifecycle {
    component: Component,
    token: Mutex<Option<CancellationToken>>,
}

impl Lifecycle {
    pub(crate) fn new(component: Component) -> Self {
        Self {
            component,
            token: Mutex::new(None),
        }
    }

    pub(crate) fn begin(&self, parent: &CancellationToken) -> Result<Running<'_>> {
        let mut slot = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::already_running(self.component));
        }
        let token = parent.child_token();
        *slot = Some(token.clone());
        Ok(Running {
            lifecycle: self,
            token,
        })
    }

    pub(crate) fn stop(&self) {
        let slot = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = slot.as_ref() {
            token.cancel();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Marks the component stopped again when dropped, including on panic.
pub(crate) struct Running<'a> {
    lifecycle: &'a Lifecycle,
    pub(crate) token: CancellationToken,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut slot = self
            .lifecycle
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}
