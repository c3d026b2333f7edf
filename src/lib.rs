//! # pulsebase-realtime
//!
//! Realtime subscription client for PulseBase backends.
//!
//! This crate maintains one persistent server-sent-events stream per
//! client, multiplexes any number of topic subscriptions over it, and
//! reconnects with backoff when the stream drops, re-declaring the full
//! topic set under the fresh client id so no subscriber has to care.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pulsebase_realtime::RealtimeClient;
//!
//! let client = RealtimeClient::new("https://pb.example.com")?;
//!
//! let sub = client
//!     .subscribe(["posts"], |msg| match msg {
//!         Ok(event) => println!("{} on {}: {}", event.action, event.topic, event.payload),
//!         Err(err) => eprintln!("stream fault: {err}"),
//!     })
//!     .await?;
//!
//! // ... later
//! sub.unsubscribe();
//! ```
//!
//! ## Topics
//!
//! - `"<collection>"` — every record change in a collection
//! - `"<collection>/<recordID>"` — changes to one record
//! - `"*"` — all topics

mod client;
mod config;
mod connection;
mod dispatch;
mod error;
mod frame;
mod retry;
mod subscription;
mod sync;

pub mod prelude;

pub use client::RealtimeClient;
pub use config::{AuthTokenSource, RealtimeConfig};
pub use connection::ConnectionState;
pub use error::RealtimeError;
pub use frame::{Action, Event};
pub use subscription::Subscription;

pub use serde_json::Value;
