use std::net::SocketAddr;

use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
};
use hyper::{Body, Response, Server};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::echo_config::{EchoConfiguration, TlsConfiguration};
use crate::tls;
use crate::Router;

pub struct EchoServer {
    router: Router,
    tls: Option<TlsConfiguration>,
    address: SocketAddr,
}

impl EchoServer {
    pub fn new(configuration: &EchoConfiguration, router: Router) -> Self {
        Self {
            router,
            tls: configuration.http_configuration.tls.clone(),
            address: configuration.http_configuration.listen_on,
        }
    }

    pub async fn serve(&self) -> anyhow::Result<()> {
        // The TLS and plain arms are near duplicates: the service fn closures
        // capture different connection types, and hyper's service types are
        // not exported in a way that lets us write one wrapper for both.
        match &self.tls {
            Some(tls) => {
                let mk_svc = make_service_fn(move |conn: &TlsStream<TcpStream>| {
                    let (inner, _) = conn.get_ref();
                    // The error is mapped to a String because the io::Error is
                    // not cloneable, and the captured value must be.
                    let addr_res = inner.peer_addr().map_err(|e| e.to_string());
                    let r = self.router.clone();
                    Box::pin(async move {
                        Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                            let r2 = r.clone();
                            // The service future must be infallible, so a
                            // failed getpeername (in practice only seen for
                            // interrupted connections) becomes a 500.
                            let a_res = addr_res.clone();
                            async move {
                                match a_res {
                                    Ok(addr) => r2.route(req, addr).await,
                                    Err(e) => {
                                        tracing::error!(error = %e, "Socket connection error on new connection");
                                        Ok(Response::builder()
                                            .status(hyper::http::StatusCode::INTERNAL_SERVER_ERROR)
                                            .body(Body::from("Socket connection error"))
                                            .unwrap())
                                    }
                                }
                            }
                        }))
                    })
                });
                Server::builder(
                    tls::TlsHyperAcceptor::new(&self.address, &tls.cert_path, &tls.key_path)
                        .await?,
                )
                .serve(mk_svc)
                .await?;
            }
            None => {
                let mk_svc = make_service_fn(move |conn: &AddrStream| {
                    let addr = conn.remote_addr();
                    let r = self.router.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                            let r2 = r.clone();
                            async move { r2.route(req, addr).await }
                        }))
                    }
                });
                Server::bind(&self.address).serve(mk_svc).await?;
            }
        }

        Ok(())
    }
}
