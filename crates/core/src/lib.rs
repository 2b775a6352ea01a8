//! Core email delivery logic for postbox.
//!
//! - [`TemplateEngine`]: renders a template key and JSON data into a message
//! - [`EmailProvider`]: transmits rendered mail (SMTP, `SendGrid`, log)
//! - [`EmailService`]: enqueue API, batch claim-and-send cycle, queue stats

pub mod services;

pub use services::*;
