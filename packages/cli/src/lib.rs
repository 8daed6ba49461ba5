// ABOUTME: Library half of the codebox operator CLI
// ABOUTME: Command implementations and terminal rendering shared by the binary and its tests

pub mod commands;
pub mod render;

pub use commands::App;
