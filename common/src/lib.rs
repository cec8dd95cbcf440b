pub mod client;
pub mod dirs;
