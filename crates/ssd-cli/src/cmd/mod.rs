pub mod agent;
pub mod daemon;
