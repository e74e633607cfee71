//! Read-only HTTP view over the directory holding the output file.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use axum::Router;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

pub struct FileServer {
    addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl FileServer {
    /// Binds `addr` and serves the directory containing `output_file`.
    pub async fn bind(addr: SocketAddr, output_file: &Path) -> io::Result<Self> {
        let root = serving_root(output_file);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .fallback_service(ServeDir::new(&root))
            .layer(TraceLayer::new_for_http());

        let stop = CancellationToken::new();
        let shutdown = stop.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(error) = result {
                warn!(?error, "file server failed");
            }
        });

        info!(%addr, root = %root.display(), "file server listening, serving the output directory");
        Ok(Self { addr, stop, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting requests and waits for the server task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(error) = self.task.await {
            warn!(?error, "file server task failed");
        }
    }
}

fn serving_root(output_file: &Path) -> PathBuf {
    match output_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn bare_file_name_serves_current_directory() {
        assert_eq!(serving_root(Path::new("output.json")), PathBuf::from("."));
        assert_eq!(
            serving_root(Path::new("/var/log/clique/output.json")),
            PathBuf::from("/var/log/clique")
        );
    }

    #[tokio::test]
    async fn bind_reports_an_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = taken.local_addr().expect("addr");

        let result = FileServer::bind(addr, Path::new("output.json")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serves_the_output_file() {
        let dir = std::env::temp_dir().join(format!("clique-files-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.expect("create dir");
        let output = dir.join("output.json");
        tokio::fs::write(&output, "performed action:add key:A value:a\n")
            .await
            .expect("write output");

        let server = FileServer::bind("127.0.0.1:0".parse().expect("addr"), &output)
            .await
            .expect("bind file server");

        let mut stream = tokio::net::TcpStream::connect(server.local_addr())
            .await
            .expect("connect");
        stream
            .write_all(b"GET /output.json HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("send request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");

        server.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("performed action:add key:A value:a"));
    }
}
