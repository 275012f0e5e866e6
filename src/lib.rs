pub mod config;
pub mod flows;
pub mod observability;
