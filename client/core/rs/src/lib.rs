//! Shared entities for the Container Census system.
//!
//! Everything that crosses a process boundary (server <-> agent,
//! server <-> collector, server <-> browser) is defined here, along with
//! the timestamp format helpers used by the persistence layer.

pub mod entities;
