//! Core domain types
//!
//! This module contains the core domain structures used across flotilla services.
//! These types represent the persisted entities and are shared between the
//! coordinator (which persists them), the worker (which executes jobs) and the CLI.

pub mod job;
pub mod provision;
