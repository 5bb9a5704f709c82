//! Shared query cache with request coalescing and a network-mode policy.
//!
//! A [`QueryClient`] owns a registry of query entries keyed by structural
//! [`QueryKey`]s, plus the mutations issued through it. One policy object,
//! fixed when the client is built, decides whether each fetch goes out while
//! the [`OnlineManager`] reports the process offline.
//!
//! ```ignore
//! let client = QueryClient::configure("queries: { networkMode: always }")?;
//! let _sub = client.subscribe(query_key!["user", 42], |state| {
//!   tracing::info!(status = ?state.status, "user changed");
//! });
//! let user = client.fetch_query(query_key!["user", 42], query_fn(|| load_user(42))).await?;
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod key;
pub mod logging;
pub mod mutation;
pub mod online;
pub mod query;
mod retryer;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::{MutateOptions, QueryClient, QueryClientBuilder};
pub use config::{Config, DefaultOptions, NetworkMode};
pub use error::{Error, Result};
pub use event::{CacheEvent, EventStream};
pub use key::{KeyPart, QueryKey};
pub use mutation::{Mutation, MutationState, MutationStatus};
pub use online::OnlineManager;
pub use query::{query_fn, FetchStatus, Query, QueryFn, QueryState, QueryStatus, Subscription};
pub use transport::{HttpTransport, Method, Request, Transport};
