//! Types shared between the firmament engine and the presentation layer.

pub mod config;
pub mod protocol;
pub mod vec3;
