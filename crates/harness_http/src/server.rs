// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`BackgroundServer`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;

use futures::FutureExt;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

use crate::response::GenericResponse;

/// Errors that can occur while starting a [`BackgroundServer`]
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    /// The runtime the server is served on couldn't be built.
    #[error("could not build {name} runtime: {source}")]
    Runtime {
        name: String,
        source: std::io::Error,
    },
    /// The listening socket couldn't be opened.
    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// An HTTP/1 server running on its own multi-threaded runtime.
///
/// This exists so that blocking test code can host HTTP endpoints without itself being
/// async. Every connection is handled in its own task, so a slow response to one
/// connection never holds up another.
///
/// Closing (or dropping) the server stops accepting connections and abandons any
/// in-flight ones; it never waits for them.
pub struct BackgroundServer {
    name: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    runtime: Option<Runtime>,
}

impl BackgroundServer {
    /// Listen on `addr` and answer requests with `responder`.
    ///
    /// Use port 0 to have the OS pick a free port, then look it up with
    /// [`local_addr`](Self::local_addr).
    pub fn bind<R, F>(name: &str, addr: SocketAddr, responder: R) -> Result<Self, ServerError>
    where
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(name)
            .enable_all()
            .build()
            .map_err(|source| ServerError::Runtime {
                name: name.to_owned(),
                source,
            })?;

        let bind_err = |source| ServerError::Bind { addr, source };
        let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener).map_err(bind_err)?
        };

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let span = info_span!("server", server = name, addr = %local_addr);
        runtime.spawn(serve(listener, responder, shutdown_receiver).instrument(span));

        Ok(Self {
            name: name.to_owned(),
            local_addr,
            shutdown,
            runtime: Some(runtime),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop serving. Calling this more than once is harmless.
    pub fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(runtime) = self.runtime.take() {
            info!("Closing {} on {}", self.name, self.local_addr);
            // Handlers may be parked forever (that's what tarpitting is), so the
            // runtime must not wait for them.
            runtime.shutdown_background();
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling a connection and shutting it down both need exclusive access.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}

async fn serve<R, F>(listener: TcpListener, responder: R, mut shutdown: watch::Receiver<bool>)
where
    R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = GenericResponse> + Send + 'static,
{
    info!("Started serving");
    loop {
        let accepted = select! {
            biased; // never accept once shut down
            _ = shutdown.wait_for(|&done| done) => break,
            accepted = listener.accept() => accepted,
        };
        let (connection, peer_addr) = match accepted {
            Ok(a) => a,
            Err(err) => {
                error!("Couldn't accept connection: {err}");
                continue;
            }
        };

        let respond = responder.clone();
        let service = service_fn(move |request: Request<Incoming>| {
            let respond = respond.clone();
            async move {
                debug!("Request: {} {}", request.method(), request.uri());
                let response = respond(request, peer_addr).await;
                debug!("Response: {}", response.status());
                Ok::<_, Infallible>(response)
            }
        });
        let mut shutdown_receiver = shutdown.clone();
        let connection_task = async move {
            let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
            let http_connection =
                http1::Builder::new().serve_connection(TokioIo::new(connection), service);
            if let Err(err) = with_graceful_shutdown(http_connection, wants_shutdown).await {
                debug!("Error serving: {err}");
            }
        };
        tokio::task::spawn(connection_task.instrument(info_span!("connection", addr = %peer_addr)));
    }
    info!("Stopped serving");
}
