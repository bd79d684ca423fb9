pub mod allocator;
pub mod config;
pub mod error;
pub mod ip;
pub mod keys;
pub mod store;
pub mod subnet;

pub use allocator::{
    build_allocator, connect_allocator, connect_existing_allocator, open_allocator, Ipam,
};
pub use config::{IpamSettings, NetConf};
pub use error::IpamError;
