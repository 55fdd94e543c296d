// Sync Coordinator Server - replication engine behind an HTTP+WS surface

use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use sync_coordinator::{api::create_sync_router, app_state::AppState, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let addr = config.server_address();

    // Initialize application state
    let app_state = AppState::new(config).await.map_err(|e| anyhow::anyhow!("{}", e))?;

    // Build main application router
    let app = Router::new()
        .merge(create_sync_router(app_state))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    // Start server
    println!("🚀 Sync Coordinator starting on http://{}", addr);
    println!("📋 API overview:");
    println!("  POST   /register                    - Register a node");
    println!("  GET    /nodes                       - List nodes with status");
    println!("  DELETE /nodes/{{id}}                  - Remove node (cascades)");
    println!("  POST   /files/upload                - Upload a new version");
    println!("  POST   /files/{{id}}/delta            - Submit a delta upload");
    println!("  GET    /files/{{id}}/history          - Causal version history");
    println!("  POST   /files/{{id}}/restore          - Restore an old version");
    println!("  GET    /conflicts                   - Unresolved conflicts");
    println!("  GET    /causal-order                - Events in causal order");
    println!("  GET    /ws                          - Event push stream");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
