//! Repository layer over the database entities.

mod email_job;
mod user;

pub use email_job::{EmailJobRepository, StatusCounts};
pub use user::UserRepository;
