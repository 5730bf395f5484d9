use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes prepared HTTP requests. Seam for wrapping or replacing the
/// underlying `reqwest` client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
