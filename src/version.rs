//! Protocol versions declared by reqecho to comply with CGI.

/// The version of CGI whose meta-variable rules the echo page follows.
pub const CGI_VERSION: &str = "CGI/1.1";

/// The CGI-defined "server software version", also sent as the `Server` header.
pub const SERVER_SOFTWARE_VERSION: &str = concat!("reqecho/", env!("CARGO_PKG_VERSION"));
