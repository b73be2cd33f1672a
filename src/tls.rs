//! A TLS-terminating connection acceptor for the hyper server.
//!
//! Hyper does not ship one, so this adapts tokio-rustls' acceptor to the
//! `hyper::server::accept::Accept` trait, one handshake at a time.

use core::task::{Context, Poll};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::{fs, io, sync::Arc};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::rustls::internal::pemfile;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

fn error(err: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

pub(crate) struct TlsHyperAcceptor {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    in_progress_stream: Option<Accept<TcpStream>>,
}

impl TlsHyperAcceptor {
    pub(crate) async fn new(
        addr: impl ToSocketAddrs,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let tls_config = server_config(cert_file, key_file)?;
        Ok(TlsHyperAcceptor {
            listener,
            acceptor: tls_config.into(),
            in_progress_stream: None,
        })
    }
}

fn server_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> io::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    // No client certificate authentication.
    let mut cfg = ServerConfig::new(rustls::NoClientAuth::new());
    cfg.set_single_cert(certs, key)
        .map_err(|e| error(format!("{}", e)))?;
    // ALPN accepts HTTP/1.1 only: the CGI meta-variables lean on the HOST
    // header, which http2 handles differently. Add `b"h2".to_vec()` here if
    // that ever changes.
    cfg.set_protocols(&[b"http/1.1".to_vec()]);
    Ok(Arc::new(cfg))
}

impl hyper::server::accept::Accept for TlsHyperAcceptor {
    type Conn = TlsStream<TcpStream>;
    type Error = io::Error;

    fn poll_accept(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
        let mut accept = match self.in_progress_stream.take() {
            Some(s) => {
                tracing::trace!("TLS handshake currently in progress. Polling for current status");
                s
            }
            None => {
                tracing::trace!("No handshake in progress, checking for new connection");
                let socket = match Pin::new(&mut self.listener).poll_accept(cx) {
                    Poll::Ready(Ok((socket, _))) => socket,
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                    Poll::Pending => return Poll::Pending,
                };
                self.acceptor.accept(socket)
            }
        };

        match Pin::new(&mut accept).poll(cx) {
            Poll::Ready(Ok(stream)) => {
                tracing::trace!("TLS handshake complete, returning active connection");
                Poll::Ready(Some(Ok(stream)))
            }
            // Plain-http requests against the TLS port and bad client
            // certificates both surface as InvalidData. Nothing more can be
            // done with the connection, so drop it and wake the task to poll
            // for a fresh one.
            Poll::Ready(Err(e)) if matches!(e.kind(), std::io::ErrorKind::InvalidData) => {
                tracing::trace!("Got invalid https request: {:?}", e);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => {
                self.in_progress_stream = Some(accept);
                Poll::Pending
            }
        }
    }
}

/// Load the public certificate chain from a PEM file.
fn load_certs(filename: impl AsRef<Path>) -> io::Result<Vec<rustls::Certificate>> {
    let certfile = fs::File::open(&filename).map_err(|e| {
        error(format!(
            "failed to open {}: {}",
            filename.as_ref().display(),
            e
        ))
    })?;
    let mut reader = io::BufReader::new(certfile);

    pemfile::certs(&mut reader).map_err(|_| error("failed to load certificate".into()))
}

/// Load a single PKCS#8 private key from a PEM file.
fn load_private_key(filename: impl AsRef<Path>) -> io::Result<rustls::PrivateKey> {
    let keyfile = fs::File::open(&filename).map_err(|e| {
        error(format!(
            "failed to open {}: {}",
            filename.as_ref().display(),
            e
        ))
    })?;
    let mut reader = io::BufReader::new(keyfile);

    let keys = pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|_| error("failed to load private key".into()))?;
    if keys.len() != 1 {
        return Err(error("expected a single private key".into()));
    }
    Ok(keys[0].clone())
}
