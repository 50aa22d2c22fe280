//! Shared utility modules used across strata components.

pub mod varint;
