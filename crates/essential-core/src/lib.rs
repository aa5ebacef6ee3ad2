//! Core abstractions for Essential: the secure storage contract and the
//! installation identifier built on top of it.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod installation;
pub mod storage;
