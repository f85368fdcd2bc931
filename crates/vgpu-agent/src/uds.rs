//! gRPC channels over unix domain sockets.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

/// Connects to the gRPC server listening on `socket_path`. The endpoint URI
/// is only a placeholder, every connection goes to the socket.
pub async fn connect(socket_path: impl Into<PathBuf>, timeout: Duration) -> io::Result<Channel> {
    let socket_path = socket_path.into();
    let connect = Endpoint::try_from("http://[::]:50051")
        .map_err(|e| io::Error::other(e.to_string()))?
        .connect_timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                tokio::net::UnixStream::connect(socket_path)
                    .await
                    .map(TokioIo::new)
            }
        }));

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out connecting to socket"))?
        .map_err(|e| io::Error::other(e.to_string()))
}
