use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tracing::info;

use slotgate::admission::Admission;
use slotgate::clock::{Clock, SystemClock};
use slotgate::config::Settings;
use slotgate::http::{self, AppState};
use slotgate::observability;
use slotgate::remote::RemoteStore;
use slotgate::store::SlotStore;
use slotgate::tenant::TenantManager;
use slotgate::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    observability::init(settings.metrics_port)?;

    std::fs::create_dir_all(&settings.store.data_dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tenant_manager = Arc::new(TenantManager::new(
        settings.store.data_dir.clone(),
        settings.store.compact_threshold,
        settings.store.reap_interval,
        clock.clone(),
    ));

    let store: Arc<dyn SlotStore> = match &settings.store.remote_url {
        Some(url) => {
            info!("admission store: remote server");
            Arc::new(RemoteStore::connect(url).await?)
        }
        None => {
            info!(
                "admission store: local engine, tenant {} in {}",
                settings.store.tenant,
                settings.store.data_dir.display()
            );
            tenant_manager.get_or_create(&settings.store.tenant)?
        }
    };

    info!(
        "admission: {}, capacity {}, ttl {}s, heartbeat {}s",
        if settings.admission.enabled { "enabled" } else { "disabled" },
        settings.admission.capacity,
        settings.admission.ttl_seconds,
        settings.admission.heartbeat_seconds
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let store_server = match settings.store.serve_port {
        Some(port) => {
            let tls = slotgate::tls::load_tls_acceptor(
                settings.store.tls_cert.as_deref(),
                settings.store.tls_key.as_deref(),
            )?;
            let addr = format!("{}:{port}", settings.store.serve_bind);
            let listener = TcpListener::bind(&addr).await?;
            info!("store server listening on {addr}");
            info!("  max_connections: {}", settings.store.max_connections);
            info!("  tls: {}", if tls.is_some() { "enabled" } else { "disabled" });
            Some(tokio::spawn(serve_store(
                listener,
                tenant_manager.clone(),
                settings.store.password.clone(),
                tls,
                settings.store.max_connections,
                shutdown_rx.clone(),
            )))
        }
        None => None,
    };

    let state = AppState {
        admission: Arc::new(Admission::new(store, settings.admission.clone())),
        clock,
        cookie_secure: settings.http.cookie_secure,
    };
    let app = http::routes(
        state,
        settings.http.rate_limit_max,
        settings.http.rate_limit_window,
    );
    http::serve(
        &settings.http.bind,
        settings.http.port,
        app,
        shutdown_requested(shutdown_rx),
    )
    .await?;

    if let Some(handle) = store_server {
        handle.await?;
    }
    info!("slotgate stopped");
    Ok(())
}

/// Accept store-server connections until shutdown, then drain in-flight ones for up to 10s.
async fn serve_store(
    listener: TcpListener,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<pgwire::tokio::TlsAcceptor>,
    max_connections: usize,
    shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let stop = shutdown_requested(shutdown);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("store connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();
                let tls = tls.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, tm, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut stop => {
                info!("stopping store accept loop");
                break;
            }
        }
    }

    info!("draining store connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all store connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} store connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
