//! Command-line access to the query compiler: list dialects and functions,
//! compile query specs and translate them into SQL.

pub mod cli;
