//! The Raft role machine and its driving loop.

pub mod config;
pub mod messages;
pub mod node;
pub mod server;
pub mod ticker;

pub use config::RaftConfig;
pub use messages::{
    AppendEntriesReq, AppendEntriesResp, ClientResponse, InstallSnapshotReq, InstallSnapshotResp,
    Message, MessageId, NodeId, Outbound, Reply, RequestVoteReq, RequestVoteResp,
};
pub use node::{RaftNode, Role, Snapshotter};
pub use server::{RaftHandle, RaftServer, SharedNode};
pub use ticker::Ticker;
