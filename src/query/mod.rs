//! Selector language: parsing, evaluation and selection results

pub mod expr;
pub mod parser;
pub mod selection;
pub mod selector;

pub use parser::parse_expression;
pub use selection::*;
pub use selector::*;
