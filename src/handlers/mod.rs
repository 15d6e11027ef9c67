pub mod auth;
pub mod health_handlers;
pub mod version_handlers;
