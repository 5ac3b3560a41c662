//! Donation distribution workflow.
//!
//! Donors pledge money or goods to an NGO, orphanages ask NGOs for help, and the NGO decides
//! where each pledge goes. [`service::DistributionService::decide`] is the single writer of
//! donation status, the request clean-up and the audit trail.

pub mod api;
pub mod config;
pub mod directory;
pub mod donation;
pub mod error;
pub mod history;
pub mod matching;
pub mod request;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
