//! # Word Scramble Client Library
//!
//! Client-side building blocks for the word-scramble game: a framed TCP
//! connection to the server, the login conversations (register, login,
//! token resume), and helpers for reading the server's prompts.
//!
//! The interactive binary in `main.rs` drives these from stdin; tests and
//! tooling can use [`network::ServerConnection`] directly to script a
//! headless player.

pub mod network;
