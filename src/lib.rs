// Library exports for the mailrpa crate
// The binary and the integration tests both build on these modules

pub mod attempt;
pub mod browser;
pub mod config;
pub mod database;
pub mod email;
pub mod failure;
pub mod link_extractor;
pub mod orchestrator;
