use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const API_BIND_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);
pub const RECONNECT_BACKOFF_SECS: u64 = 5;
pub const SUBSCRIPTION_REFRESH_SECS: u64 = 600;
pub const FEED_TICK_INTERVAL_MS: u64 = 250;
pub const FEED_PRICE_SCALE: u32 = 100;
