//! Core domain types
//!
//! This module contains the structures shared between the scheduler and the
//! transports it drives. Nothing here performs I/O.

pub mod connection;
pub mod handle;
pub mod message;
pub mod outcome;
pub mod tuning;
