//! Wire types shared between the chat engine and anything that speaks to the
//! message router.

pub mod domain;
pub mod error;
pub mod protocol;

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod protocol_tests;
