use std::future::Future;
use std::net::SocketAddr;
use std::thread;

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

/// Serve `dir` on localhost until Ctrl-C, then call `on_shutdown`.
pub fn start<F>(dir: Utf8PathBuf, port: u16, on_shutdown: F) -> thread::JoinHandle<Result<(), anyhow::Error>>
where
    F: FnOnce() + Send + 'static,
{
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), %dir, "starting a HTTP server");

    thread::spawn(move || {
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(anyhow::Error::from)
            .and_then(|rt| rt.block_on(listen(port, dir)));

        on_shutdown();
        result
    })
}

async fn listen(port: u16, dir: Utf8PathBuf) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(address).await?;

    serve(listener, dir, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await
}

async fn serve(
    listener: tokio::net::TcpListener,
    dir: Utf8PathBuf,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), anyhow::Error> {
    let router = Router::new()
        // path to the output directory
        .fallback_service(ServeDir::new(dir));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
