//! Shared fixtures for the natpunch integration tests

pub mod fixtures;
