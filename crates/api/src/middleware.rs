//! Shared request state.

use std::sync::Arc;

use postbox_core::EmailService;
use postbox_queue::ProcessorSupervisor;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub email_service: Arc<EmailService>,
    pub supervisor: ProcessorSupervisor,
}

impl AppState {
    #[must_use]
    pub const fn new(email_service: Arc<EmailService>, supervisor: ProcessorSupervisor) -> Self {
        Self {
            email_service,
            supervisor,
        }
    }
}
