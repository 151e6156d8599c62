//! Route handlers

pub mod health;
pub mod upload;
