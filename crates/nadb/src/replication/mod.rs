pub mod client;
pub mod connection;
pub mod manager;
pub mod server;

pub use client::{ClientStats, ReplicationClient};
pub use connection::{
    Backoff, InboundPrimaryLink, OutboundReplicaLink, PrimaryLinkStats, ReplicaStats, SendOutcome,
};
pub use manager::{ApplyFn, ApplyOutcome, ReplicationManager, ReplicationStats, RoleStats};
pub use server::{ReplicationServer, ServerStats};
