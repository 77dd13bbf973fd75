//! The declarative specification language (spec §3, §6): AST, lexer,
//! parser, describer, and static validation.

pub mod ast;
pub mod describe;
pub mod parser;
pub mod token;
pub mod validate;

pub use ast::{
    Condition, ExistentialCondition, Label, LabeledGiven, Match, PathCondition, Projection, Role,
    Specification, TypeName,
};
pub use describe::describe;
pub use parser::parse;
pub use validate::{validate, Schema};
