//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use pulsebase_realtime::prelude::*;
//!
//! let client = RealtimeClient::new("https://pb.example.com")?;
//! let sub = client.subscribe(["posts"], |msg| { /* ... */ }).await?;
//! ```

pub use crate::{
    Action, AuthTokenSource, ConnectionState, Event, RealtimeClient, RealtimeConfig,
    RealtimeError, Subscription,
};
