use std::net::{IpAddr, Ipv4Addr};

const HUB_PORT: &str = "HUB_PORT";

const DEFAULT_PORT: u16 = 51243;

pub fn get_default_port() -> u16 {
    DEFAULT_PORT
}

/// Port from `HUB_PORT`, if set and valid.
pub fn get_port() -> Option<u16> {
    std::env::var(HUB_PORT).ok().and_then(|res| res.parse().ok())
}

const HUB_ADDR: &str = "HUB_ADDR";

const DEFAULT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));

pub fn get_default_addr() -> IpAddr {
    DEFAULT_ADDR
}

/// Listen address from `HUB_ADDR`, if set and valid.
pub fn get_addr() -> Option<IpAddr> {
    std::env::var(HUB_ADDR).ok().and_then(|res| res.parse().ok())
}

const HUB_API_TOKEN: &str = "HUB_API_TOKEN";

pub fn get_api_token() -> Option<String> {
    std::env::var(HUB_API_TOKEN).ok().filter(|t| !t.is_empty())
}

const HUB_URL: &str = "HUB_URL";

/// Agent endpoint the reference agent connects to.
pub fn get_hub_url() -> String {
    std::env::var(HUB_URL)
        .unwrap_or_else(|_| format!("ws://127.0.0.1:{DEFAULT_PORT}/agent/connect"))
}
