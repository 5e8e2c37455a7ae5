//! Constellation quiz engine library.
//!
//! This module exposes the sky model, quizzes, lobbies and the session loop
//! for use in tests and binaries.

pub mod astro;
pub mod bot;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lobby;
pub mod place_time;
pub mod quiz;
pub mod service;
pub mod session;
pub mod session_loop;
pub mod view;
