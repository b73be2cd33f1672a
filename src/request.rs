use std::{collections::HashMap, net::SocketAddr};

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
}

/// Per-server context that every request sees.
#[derive(Clone, Debug)]
pub struct RequestGlobalContext {
    pub default_host: String,
    pub use_tls: bool,
    pub global_env_vars: HashMap<String, String>,
}
