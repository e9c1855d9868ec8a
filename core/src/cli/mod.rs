//! Command-line argument parsing.

mod parse;

pub use parse::parse_args;
