pub mod access;
pub mod config;
pub mod database;
pub mod recovery;
pub mod storage;
