//! Database entities.

#![allow(missing_docs)]

pub mod email_job;
pub mod user;

pub use email_job::Entity as EmailJob;
pub use user::Entity as User;
