use std::future::Future;
use std::io;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

/// Serve `app` on `bind:port` until `shutdown` resolves, then finish in-flight requests.
pub async fn serve(
    bind: &str,
    port: u16,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let listener = TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("slotgate http listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("http server shutdown complete");
    Ok(())
}
