//! Business logic services.

pub mod email;
pub mod provider;
pub mod retry;
pub mod template;

pub use email::{
    BatchSummary, EmailService, JobFailure, QueueStats, SendDirectEmailInput, SendUserEmailInput,
};
pub use provider::{
    DeliveryReceipt, EmailProvider, LogProvider, OutgoingEmail, ProviderError, SendGridProvider,
    SmtpProvider, build_provider,
};
pub use retry::RetryConfig;
pub use template::{RenderedEmail, TemplateDescriptor, TemplateEngine, TemplateError};
