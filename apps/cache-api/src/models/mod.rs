pub mod cache;
pub mod profile;
