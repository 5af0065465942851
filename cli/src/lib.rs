pub mod handlers;
pub mod logger;
