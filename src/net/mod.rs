//! Request/response model and the network boundary.

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use client::{FetchError, HttpClient, Network};
pub use types::{resolve_url, Destination, Request, RequestMode, Response, ResponseType};
