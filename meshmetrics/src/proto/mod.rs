#[rustfmt::skip]
pub mod forwardrpc;

pub use forwardrpc::*;
