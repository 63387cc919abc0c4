pub mod collab;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod proto;
pub mod reaper;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
