//! Community Backend entry point

#[tokio::main]
async fn main() {
    community_backend::run().await;
}
