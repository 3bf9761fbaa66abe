use axum::extract::DefaultBodyLimit;
use tracing::{debug, error, info};

use crate::proxy::routes::build_routes;
use crate::proxy::state::AppState;

// Inbound side is pinned to HTTP/1.1: the serve loop drives hyper's http1
// builder directly instead of letting axum negotiate.
pub async fn start_server(
    state: AppState,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), String> {
    let host = if state.config.server.allow_lan_access {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, state.config.server.port);

    let app = build_routes()
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(state.config.server.max_body_size))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Address {} binding failed: {}", addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to read local address: {}", e))?;

    info!("Proxy server started at http://{}", local_addr);

    let handle = tokio::spawn(async move {
        use hyper::server::conn::http1;
        use hyper_util::rt::TokioIo;
        use hyper_util::service::TowerToHyperService;

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let io = TokioIo::new(stream);

                    use hyper::body::Incoming;
                    use tower::ServiceExt;
                    let app_with_info =
                        app.clone()
                            .map_request(move |mut req: axum::http::Request<Incoming>| {
                                req.extensions_mut()
                                    .insert(axum::extract::ConnectInfo(remote_addr));
                                req
                            });
                    let service = TowerToHyperService::new(app_with_info);

                    tokio::task::spawn(async move {
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await
                        {
                            debug!("Connection handling ended or failed: {:?}", err);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {:?}", e);
                }
            }
        }
    });

    Ok((local_addr, handle))
}
