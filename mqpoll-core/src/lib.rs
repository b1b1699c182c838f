//! mqpoll Core
//!
//! Core types for the mqpoll retrieval scheduler.
//!
//! This crate contains:
//! - Domain types: handles, get-options, message descriptors, transport outcomes, tuning
//! - DTOs: serializable forms of the tuning surface

pub mod domain;
pub mod dto;
