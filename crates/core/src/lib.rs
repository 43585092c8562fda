//! Core types for the TTS proxy
//!
//! This crate provides the pieces every other crate leans on:
//! - WAV parsing, header construction, and concatenation
//! - Cache fingerprinting (SHA-256 over model + text)

pub mod fingerprint;
pub mod wav;

pub use fingerprint::Fingerprint;
pub use wav::{WavError, WavFormat, WavInfo};
