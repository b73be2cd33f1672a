use std::net::SocketAddr;

use hyper::{Body, Request, Response};
use tracing::instrument;

use crate::echo_config::EchoConfiguration;
use crate::request::{RequestContext, RequestGlobalContext};

pub mod echo_app;
pub mod echo_config;
pub mod echo_server;
pub mod handler;
mod http_util;
pub mod request;
mod tls;
pub mod version;

/// The default host is 'localhost:3000', matching the default listen address.
pub const DEFAULT_HOST: &str = "localhost:3000";

/// A router is responsible for taking an inbound request and sending it to
/// the appropriate handler. Some routes are built in (like healthz); every
/// other path is answered by the echo page.
#[derive(Clone)]
pub struct Router {
    global_context: RequestGlobalContext,
}

impl Router {
    pub fn from_configuration(configuration: &EchoConfiguration) -> Self {
        Router {
            global_context: configuration.request_global_context(),
        }
    }

    /// Route the request to the correct handler
    #[instrument(level = "info", skip(self, req), fields(uri = %req.uri()))]
    pub async fn route(
        &self,
        req: Request<Body>,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, hyper::Error> {
        tracing::trace!("Processing request");

        let uri_path = req.uri().path();
        match uri_path {
            "/healthz" => Ok(Response::new(Body::from("OK"))),
            _ => {
                let request_context = RequestContext { client_addr };
                let res = handler::handle(req, &request_context, &self.global_context).await;
                Ok(res)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::echo_config::HttpConfiguration;

    fn test_router() -> Router {
        Router::from_configuration(&EchoConfiguration {
            env_vars: HashMap::new(),
            http_configuration: HttpConfiguration {
                listen_on: "127.0.0.1:3000".parse().expect("Should parse address"),
                default_hostname: DEFAULT_HOST.to_owned(),
                tls: None,
            },
        })
    }

    fn client_addr() -> SocketAddr {
        "10.0.0.7:12345".parse().expect("Should parse address")
    }

    #[tokio::test]
    async fn healthz_should_answer_ok() {
        let router = test_router();
        let req = Request::builder()
            .uri("http://localhost:3000/healthz")
            .body(Body::empty())
            .unwrap();

        let res = router.route(req, client_addr()).await.expect("routed");
        assert_eq!(hyper::StatusCode::OK, res.status());

        let body = hyper::body::to_bytes(res.into_body())
            .await
            .expect("read body");
        assert_eq!(&b"OK"[..], &body[..]);
    }

    #[tokio::test]
    async fn every_other_path_should_reach_the_echo_page() {
        let router = test_router();

        for path in ["/", "/deeply/nested/path", "/healthz2"] {
            let req = Request::builder()
                .uri(format!("http://localhost:3000{}", path))
                .body(Body::empty())
                .unwrap();

            let res = router.route(req, client_addr()).await.expect("routed");
            assert_eq!(hyper::StatusCode::OK, res.status());

            let body = hyper::body::to_bytes(res.into_body())
                .await
                .expect("read body");
            let page = String::from_utf8(body.to_vec()).expect("UTF-8 page");
            assert!(page.contains("<h2>Server Variables</h2>"), "Path: {}", path);
        }
    }
}
