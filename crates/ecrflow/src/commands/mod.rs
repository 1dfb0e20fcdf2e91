pub mod build;
pub mod resolve;
