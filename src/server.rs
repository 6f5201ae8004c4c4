//! Shared server wiring: the unix/tcp listener glue reused by both
//! binaries, and the single unary logging layer every gRPC service is
//! served behind. The listener wrapper is carried over unchanged from the
//! donor's own `CsiServer`; the logging layer is new, grounded on the
//! `tower::Service<Request<Body>>` router the donor's `csi` crate hand-rolls
//! in `router.rs` to dispatch by `req.uri().path()`.

use std::{
    fs,
    io::ErrorKind,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::TryStreamExt;
use http::{Request, Response};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{
    body::BoxBody,
    transport::{server::Connected, Body, Server},
};
use tower::{Layer, Service};

use crate::{
    controller_svc::ControllerSvc,
    csi::{
        controller_server::ControllerServer, identity_server::IdentityServer,
        node_server::NodeServer,
    },
    filter::filter_server::FilterServer,
    filter_svc::FilterService,
    identity::Identity,
    node_svc::NodeSvc,
    shutdown_event,
};

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

impl tokio::io::AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Removes a stale socket from a previous instance, then binds and wraps
/// the listener into the stream shape `tonic::transport::Server` expects.
fn bind_unix(
    path: &str,
) -> std::io::Result<impl futures::Stream<Item = std::io::Result<UnixStream>>> {
    match fs::remove_file(path) {
        Ok(_) => info!("removed stale socket {}", path),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    Ok(UnixListenerStream::new(listener).map_ok(UnixStream))
}

/// The RPC name logged and matched against `Probe`, taken from the last
/// path segment of `/<package>.<Service>/<Method>`.
fn rpc_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Logs method name and outcome for every unary call except `Probe`, which
/// fires on every kubelet liveness tick and would otherwise drown the log
///.
#[derive(Clone, Default)]
pub struct LogLayer;

impl<S> Layer<S> for LogLayer {
    type Service = LogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LogService { inner }
    }
}

#[derive(Clone)]
pub struct LogService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for LogService<S>
where
    S: Service<Request<Body>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        let loggable = rpc_name(&path) != "Probe";
        if loggable {
            debug!("-> {}", path);
        }

        // Service::call requires &mut self and may be invoked again before
        // the returned future resolves; swap in a clone so `inner` stays
        // free to poll_ready while this call is in flight.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = inner.call(req).await;
            if loggable {
                match &result {
                    Ok(resp) => debug!("<- {} ({})", path, resp.status()),
                    Err(_) => warn!("<- {} transport error", path),
                }
            }
            result
        })
    }
}

/// Serve the CSI Identity/Controller/Node services behind `endpoint`, which
/// is either `unix://<path>` or `tcp://<host:port>`.
pub async fn run_plugin(
    endpoint: &str,
    identity: Identity,
    controller: ControllerSvc,
    node: NodeSvc,
) -> Result<(), String> {
    let router = Server::builder()
        .layer(LogLayer)
        .add_service(IdentityServer::new(identity))
        .add_service(ControllerServer::new(controller))
        .add_service(NodeServer::new(node));

    if let Some(path) = endpoint.strip_prefix("unix://") {
        let incoming = bind_unix(path).map_err(|e| format!("failed to bind {}: {}", path, e))?;
        info!("csif-plugin listening on unix://{}", path);
        router
            .serve_with_incoming_shutdown(incoming, shutdown_event::wait())
            .await
            .map_err(|e| format!("plugin server failed: {}", e))
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let addr = addr
            .parse()
            .map_err(|e| format!("invalid tcp endpoint {}: {}", addr, e))?;
        info!("csif-plugin listening on tcp://{}", addr);
        router
            .serve_with_shutdown(addr, shutdown_event::wait())
            .await
            .map_err(|e| format!("plugin server failed: {}", e))
    } else {
        Err(format!(
            "endpoint {} must start with unix:// or tcp://",
            endpoint
        ))
    }
}

/// Serve the filter sidecar's internal `Filter` service behind `endpoint`.
pub async fn run_filter(endpoint: &str, filter_svc: FilterService) -> Result<(), String> {
    let router = Server::builder()
        .layer(LogLayer)
        .add_service(FilterServer::new(filter_svc));

    if let Some(path) = endpoint.strip_prefix("unix://") {
        let incoming = bind_unix(path).map_err(|e| format!("failed to bind {}: {}", path, e))?;
        info!("csif-filter listening on unix://{}", path);
        router
            .serve_with_incoming_shutdown(incoming, shutdown_event::wait())
            .await
            .map_err(|e| format!("filter server failed: {}", e))
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let addr = addr
            .parse()
            .map_err(|e| format!("invalid tcp endpoint {}: {}", addr, e))?;
        info!("csif-filter listening on tcp://{}", addr);
        router
            .serve_with_shutdown(addr, shutdown_event::wait())
            .await
            .map_err(|e| format!("filter server failed: {}", e))
    } else {
        Err(format!(
            "endpoint {} must start with unix:// or tcp://",
            endpoint
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_name_strips_the_service_prefix() {
        assert_eq!(rpc_name("/csi.v1.Identity/Probe"), "Probe");
        assert_eq!(rpc_name("/csi.v1.Node/NodeStageVolume"), "NodeStageVolume");
    }
}
