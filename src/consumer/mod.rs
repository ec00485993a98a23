//! # Consumer Engine
//!
//! Pollers, workers and the subscription groups that bind them together.
//!
//! ```text
//! provider ──receive──▶ QueuePoller ──bounded channel──▶ Worker ──pipeline──▶ handler
//!     ▲                     │  ▲                                     │
//!     └──delete / re-time / dead-letter◀── settlement ◀── completion ┘
//! ```

mod group;
mod poller;
mod work;
mod worker;

pub use group::{GroupHandle, SubscriptionGroup};
pub use poller::{PollerStats, PollerStatsSnapshot};
pub use worker::{GroupStats, GroupStatsSnapshot};

pub(crate) use poller::PollerContext;
