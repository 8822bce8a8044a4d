//! Cross-crate scenarios for Switchyard, run against the in-memory backends
