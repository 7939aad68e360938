//! HTTP adapters for the remote authority.
//!
//! `ApiClient` pushes progress and reads the catalog, `HttpTransfer` streams
//! module media, and `HttpProbe` checks reachability. The engine itself only
//! sees the traits they implement.

pub mod client;
pub mod error;
pub mod media;

pub use client::ApiClient;
pub use error::RemoteError;
pub use media::{HttpProbe, HttpTransfer};
