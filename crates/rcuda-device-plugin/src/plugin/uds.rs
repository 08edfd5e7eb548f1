use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

/// Opens a gRPC channel over a Unix domain socket.
///
/// Blocks until the connection is established or `timeout` elapses.
pub async fn dial(socket_path: &Path, timeout: Duration) -> Result<Channel> {
    let path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since we're using a Unix socket connector
    let endpoint = Endpoint::from_static("http://tonic").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move {
            match UnixStream::connect(path).await {
                Ok(stream) => Ok(TokioIo::new(stream)),
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            }
        }
    }));

    tokio::time::timeout(timeout, connect)
        .await
        .with_context(|| {
            format!(
                "timed out after {timeout:?} dialing {}",
                socket_path.display()
            )
        })?
        .with_context(|| format!("failed to dial {}", socket_path.display()))
}

#[cfg(test)]
mod tests {
    use test_log::test;
    use tokio::net::UnixListener;

    use super::*;

    #[test(tokio::test)]
    async fn dials_a_listening_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("listening.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let accept = tokio::spawn(async move { listener.accept().await });

        let channel = dial(&socket, Duration::from_secs(1))
            .await
            .expect("should connect");
        let (_stream, _) = accept.await.expect("join").expect("accept");
        drop(channel);
    }

    #[test(tokio::test)]
    async fn dialing_a_missing_socket_names_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("missing.sock");

        let err = dial(&socket, Duration::from_secs(1))
            .await
            .expect_err("nothing listening");
        assert!(format!("{err:#}").contains("missing.sock"));
    }
}
