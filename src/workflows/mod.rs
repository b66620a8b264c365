pub mod callbacks;
pub mod client;
pub mod triggers;
