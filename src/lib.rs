//! Announces new YouTube uploads and live streams to Discord channels,
//! exactly once per video, from three overlapping signal paths.

pub mod config;
pub mod event;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod subscription;
pub mod util;
