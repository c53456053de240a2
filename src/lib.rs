pub mod cache;
pub mod config;
pub mod data_store;
pub mod processor;
pub mod semantic_model;
pub mod sql_parser;
pub mod utils;

#[cfg(test)]
mod tests;
