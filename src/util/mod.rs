pub mod atime;
pub mod config;
