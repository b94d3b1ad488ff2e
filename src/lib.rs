pub mod challenge;
pub mod config;
pub mod daemon;
pub mod greylist;
pub mod guard;
pub mod pickup;
pub mod policy;
pub mod rate_limiter;
pub mod server;
pub mod sources;
pub mod state;
pub mod store;

pub use challenge::SenderChallenge;
pub use config::{Config, RuleSource};
pub use greylist::GreylistEngine;
pub use rate_limiter::{Admission, Boundary, RateLimiter, UserLimit};
pub use server::Server;
pub use state::Shared;
pub use store::{ConfigStore, RuleSet};
