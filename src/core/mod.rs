pub mod errors;
pub mod models;
pub mod rate_limit;
pub mod schema;
pub mod state;
