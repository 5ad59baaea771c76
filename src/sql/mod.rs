//! SQL Safety
//!
//! Lexing, static validation and the dialect shim for generated SQL.

pub mod dialect;
pub mod lexer;
pub mod validator;

pub use validator::{RejectionReason, SqlSafetyValidator, ValidatedQuery};
