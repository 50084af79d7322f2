pub mod configuration;
pub mod labels;
pub mod retry;
