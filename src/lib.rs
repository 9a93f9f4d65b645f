//! # instalive-rs
//!
//! This crate downloads live DASH streams, including the part of the stream
//! that has already scrolled out of the manifest. The manifest of a live
//! stream only lists the newest few segments, so older segments are found by
//! walking back from the oldest known one with a learned segment interval.
//!
//! ## Usage
//!
//! A [`worker::Session`] ties everything together: it fetches the manifest,
//! picks tracks and learns the interval, then drives the backfill, the live
//! tail and the final merge.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use instalive_rs::{config::DownloaderConfig, store::LocalStorage, util, worker::Session};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // reqwest client with a middleware retrying transient errors
//!     let client = util::HttpClient::new(3).unwrap();
//!
//!     let session = Session::prepare(
//!         "https://.../live.mpd",
//!         Arc::new(client),
//!         Arc::new(LocalStorage),
//!         DownloaderConfig::default(),
//!     )
//!     .await
//!     .unwrap();
//!
//!     // Backfill and live tail side by side, then check and merge
//!     let gap = session.run_all(&CancellationToken::new()).await.unwrap();
//!     if gap.is_some() {
//!         println!("Recording is likely incomplete");
//!     }
//! }
//! ```
//!
//! Segments are stored as `{save_dir}/{track id}/{segment file}`. A segment
//! that is on disk is never downloaded again, so every action can be resumed
//! by running it again.

#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod audit;
pub mod backfill;
pub mod config;
pub mod dash;
pub mod ffmpeg;
pub mod import;
pub mod interval;
pub mod live;
pub mod merge;
pub mod select;
pub mod stats;
pub mod store;
pub mod util;
pub mod worker;
