pub mod endpoints;
pub mod variables;
