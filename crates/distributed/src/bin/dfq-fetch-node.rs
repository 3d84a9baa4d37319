use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use dfq_common::{FetchConfig, NodeId};
use dfq_distributed::grpc::FetchNodeGrpcService;
use dfq_distributed::{
    FetchReaderFactory, InMemoryTableStore, JobFetchContextService, NodeFetchOperation,
    NodeFetchService, RequestAdmission,
};
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn load_store(path: Option<String>) -> Result<InMemoryTableStore, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(InMemoryTableStore::load_json(Path::new(&p))?),
        None => Ok(InMemoryTableStore::new()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let defaults = FetchConfig::default();
    let node_id = NodeId::new(env_or_default("DFQ_NODE_ID", "node-1"));
    let bind = env_or_default("DFQ_FETCH_BIND", "0.0.0.0:50071");
    let addr: SocketAddr = bind.parse()?;
    let config = FetchConfig {
        max_concurrent_requests: env_usize_or_default(
            "DFQ_MAX_CONCURRENT_REQUESTS",
            defaults.max_concurrent_requests,
        ),
        closed_context_retention: env_usize_or_default(
            "DFQ_CLOSED_CONTEXT_RETENTION",
            defaults.closed_context_retention,
        ),
        ..defaults
    };
    config.validate()?;

    let store: Arc<dyn FetchReaderFactory> =
        Arc::new(load_store(env::var("DFQ_STORE_PATH").ok())?);
    let contexts = Arc::new(JobFetchContextService::new(
        node_id.clone(),
        store,
        config.closed_context_retention,
    ));
    let service = Arc::new(NodeFetchService::new(
        NodeFetchOperation::new(contexts),
        RequestAdmission::new(node_id.clone(), config.max_concurrent_requests),
    ));

    info!(
        node = %node_id,
        bind = %addr,
        max_concurrent_requests = config.max_concurrent_requests,
        "dfq-fetch-node started"
    );
    Server::builder()
        .add_service(FetchNodeGrpcService::new(service).into_server())
        .serve(addr)
        .await?;
    Ok(())
}
