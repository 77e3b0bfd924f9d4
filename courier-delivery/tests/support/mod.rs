//! Shared fixtures for the delivery integration tests.

pub mod mock_server;
