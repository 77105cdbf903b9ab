//! Guildcast — screen sharing for the guild portal.
//!
//! Two halves share this crate:
//!
//! - the **signaling server** ([`app`], [`api`], the registries and stores,
//!   [`tokens`]): a REST service coordinating rooms, presence, relay access
//!   grants, share history, and per-session backend credentials;
//! - the **session library** ([`session`], [`signal`], [`transport`],
//!   [`capture`]): the client-side state machine that takes a member from
//!   "share my screen" to live media over one of three interchangeable
//!   backends (browser-native peer-to-peer or two managed relays).
//!
//! The server binary lives in `main.rs`; everything else is reusable.

pub mod api;
pub mod app;
pub mod capture;
pub mod config;
pub mod error;
pub mod grants;
pub mod history;
pub mod models;
pub mod presence;
pub mod rooms;
pub mod schema;
pub mod session;
pub mod signal;
pub mod tokens;
pub mod transport;
