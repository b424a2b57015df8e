//! Real-time collaborative editing server for song timelines: a replicated
//! document model, one actor per live room, write-behind persistence, and
//! snapshot and branch management on top.

pub mod api;
pub mod app_state;
pub mod branches;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod room;
pub mod session;
pub mod snapshots;
