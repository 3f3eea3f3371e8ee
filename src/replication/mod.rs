//! Replication Module
//!
//! Master and slave services plus the wire protocol between them.

pub mod protocol;

mod master;
mod session;
mod slave;

pub use master::ReplicationMaster;
pub use session::MasterSession;
pub use slave::ReplicationSlave;
