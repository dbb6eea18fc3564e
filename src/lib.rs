#![forbid(unsafe_code)]

//! Core of the zt-dl recording downloader.
//!
//! Recordings are resolved to an HLS URL, probed with ffprobe, reduced to the
//! best audio and video stream and copied to disk with ffmpeg. The `server`
//! module queues such downloads and pushes their progress to any number of
//! connected observers.

pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod resolver;
pub mod server;

pub use error::{Error, Result};
