pub mod buffer;
pub mod executor;
pub mod frame;
pub mod model;
pub mod pending;
pub mod poller;
pub mod publisher;
