#![forbid(unsafe_code)]

//! # w3f Proxy
//!
//! Network mediation for one supervised run: the loopback port allocator,
//! the HTTP egress proxy that meters and polices guest traffic, and the
//! JSON-RPC proxy that routes chain calls and enforces the call budget.
//! Both proxies live for exactly one run and freeze their counters once
//! stopped.

pub mod http;
pub mod port;
pub mod rpc;

pub use http::{HttpProxy, HttpProxyPolicy, HttpProxySnapshot, HttpProxyStats};
pub use port::{pick_free_port, reserve_listener};
pub use rpc::{RpcProxy, RpcProxyStats};
