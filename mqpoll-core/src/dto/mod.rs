//! Data Transfer Objects
//!
//! Serializable forms of domain types, using the names applications see in
//! configuration files and JSON output.

pub mod tuning;
