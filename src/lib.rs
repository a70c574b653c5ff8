pub mod app;
pub mod audit;
pub mod config;
pub mod error;
pub mod integrity;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod metadata;
pub mod observability;
pub mod retention;
pub mod signature;
pub mod smoke;
pub mod stager;
pub mod swap;
pub mod updater;
