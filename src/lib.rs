pub mod backend;
pub mod cli;
pub mod compare;
pub mod core;
