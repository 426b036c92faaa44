pub mod command;
pub mod executor;
pub mod locator;
pub mod parse;
pub mod paths;
pub mod runner;

#[cfg(test)]
pub mod fake;
