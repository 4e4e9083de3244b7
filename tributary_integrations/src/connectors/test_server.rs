//! Local HTTP stub standing in for provider APIs in connector tests.

use axum::Router;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral port; returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
