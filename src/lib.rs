//! Offline caching and request interception for app-shell web applications.
//!
//! An [`InterceptionLayer`] sits between the pages of one scope and the
//! network. It precaches versioned releases into generations, answers every
//! request with a per-request policy and always produces a response.

pub mod cache;
pub mod config;
pub mod control;
pub mod event;
pub mod interceptor;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod strategy;

pub use cache::{CacheSource, CacheStorage, CacheStore, SqliteStorage};
pub use config::Config;
pub use control::{ControlChannel, ControlMessage, ControlReply};
pub use event::{Event, EventHandler, Outcome};
pub use interceptor::{InstallReport, InterceptionLayer};
pub use lifecycle::{LifecycleNotice, LifecycleState, Registration, Release};
pub use net::{FetchError, HttpClient, Network, Request, Response};
pub use strategy::Policy;
