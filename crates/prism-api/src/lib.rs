//! Home Assistant hub link for Prism.
//!
//! - [`protocol`]: wire types for the WebSocket API (auth, `subscribe_entities`,
//!   `call_service`, compressed entity diffs)
//! - [`link`]: the long-lived session task with reconnect, backoff and
//!   result correlation

pub mod error;
pub mod link;
pub mod protocol;

pub use error::Error;
pub use link::{
    CallOutcome, ConnectionState, HubConfig, HubLink, LinkEvent, ReconnectConfig, websocket_url,
};
pub use protocol::{
    CompressedDiff, CompressedState, DiffAdditions, DiffRemovals, EntitiesEvent, ServiceCall,
    epoch_to_datetime, is_valid_service_name,
};
