//! gRPC adapters for the node fetch action.
//!
//! RPC schema source: `proto/dfq_fetch.proto`.
//!
//! - [`FetchNodeGrpcService`]: node-side server wrapping a [`NodeFetchService`]
//! - [`GrpcFetchTransport`]: initiator-side [`FetchTransport`] with one lazily
//!   connected client per node
//!
//! `ContextNotFound` travels as `NOT_FOUND` and is rebuilt on the client from
//! the request's job and fetch phase ids.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dfq_common::{DfqError, FetchId, FetchPhaseId, JobId, NodeId, Result, TableIdent};
use dfq_planner::FetchPhase;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status};

use crate::node_fetch::NodeFetchService;
use crate::protocol::{NodeFetchRequest, NodeFetchResponse};
use crate::transport::FetchTransport;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("dfq.fetch.v1");
}

pub use v1::fetch_node_client::FetchNodeClient;
pub use v1::fetch_node_server::{FetchNode, FetchNodeServer};

#[derive(Clone)]
/// Node-side gRPC service backed by a shared [`NodeFetchService`].
pub struct FetchNodeGrpcService {
    service: Arc<NodeFetchService>,
}

impl FetchNodeGrpcService {
    pub fn new(service: Arc<NodeFetchService>) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> FetchNodeServer<Self> {
        FetchNodeServer::new(self)
    }
}

#[tonic::async_trait]
impl FetchNode for FetchNodeGrpcService {
    async fn node_fetch(
        &self,
        request: Request<v1::NodeFetchRequest>,
    ) -> std::result::Result<Response<v1::NodeFetchResponse>, Status> {
        let req = core_request(request.into_inner()).map_err(to_status)?;
        let response = self.service.handle(req).await.map_err(to_status)?;
        Ok(Response::new(proto_response(response)))
    }

    async fn setup_phase(
        &self,
        request: Request<v1::SetupPhaseRequest>,
    ) -> std::result::Result<Response<v1::SetupPhaseResponse>, Status> {
        let req = request.into_inner();
        let phase = decode_phase(&req.fetch_phase_json).map_err(to_status)?;
        self.service
            .setup_phase(JobId(req.job_id), &phase)
            .map_err(to_status)?;
        Ok(Response::new(v1::SetupPhaseResponse {}))
    }
}

#[derive(Debug)]
/// gRPC-based [`FetchTransport`] for remote nodes.
pub struct GrpcFetchTransport {
    endpoints: HashMap<NodeId, String>,
    clients: Mutex<HashMap<NodeId, FetchNodeClient<Channel>>>,
}

impl GrpcFetchTransport {
    /// `endpoints` maps each node to its `http://host:port` address.
    pub fn new(endpoints: HashMap<NodeId, String>) -> Self {
        Self {
            endpoints,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, node: &NodeId) -> Result<FetchNodeClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(node) {
            return Ok(client.clone());
        }
        let endpoint = self
            .endpoints
            .get(node)
            .ok_or_else(|| DfqError::Transport(format!("no endpoint known for node {node}")))?;
        let client = FetchNodeClient::connect(endpoint.clone())
            .await
            .map_err(|e| DfqError::Transport(format!("grpc connect to {node} failed: {e}")))?;
        clients.insert(node.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl FetchTransport for GrpcFetchTransport {
    async fn node_fetch(
        &self,
        node: &NodeId,
        request: NodeFetchRequest,
    ) -> Result<NodeFetchResponse> {
        let job_id = request.job_id;
        let fetch_phase_id = request.fetch_phase_id;
        let mut client = self.client(node).await?;
        let response = client
            .node_fetch(proto_request(request))
            .await
            .map_err(|s| from_status(s, job_id, fetch_phase_id))?;
        core_response(response.into_inner())
    }

    async fn setup_phase(&self, node: &NodeId, job_id: JobId, phase: &FetchPhase) -> Result<()> {
        let fetch_phase_json = encode_phase(phase)?;
        let mut client = self.client(node).await?;
        client
            .setup_phase(v1::SetupPhaseRequest {
                job_id: job_id.0,
                fetch_phase_json,
            })
            .await
            .map_err(|s| from_status(s, job_id, phase.phase_id))?;
        Ok(())
    }
}

fn encode_phase(phase: &FetchPhase) -> Result<Vec<u8>> {
    serde_json::to_vec(phase)
        .map_err(|e| DfqError::Execution(format!("fetch phase encode failed: {e}")))
}

fn decode_phase(payload: &[u8]) -> Result<FetchPhase> {
    serde_json::from_slice(payload)
        .map_err(|e| DfqError::InvalidConfig(format!("fetch phase decode failed: {e}")))
}

fn proto_table(table: &TableIdent) -> v1::TableIdent {
    v1::TableIdent {
        schema: table.schema.clone(),
        name: table.name.clone(),
    }
}

fn core_table(table: Option<v1::TableIdent>) -> Result<TableIdent> {
    table
        .map(|t| TableIdent::new(t.schema, t.name))
        .ok_or_else(|| DfqError::Execution("table ident missing in fetch message".to_string()))
}

fn proto_request(request: NodeFetchRequest) -> v1::NodeFetchRequest {
    v1::NodeFetchRequest {
        job_id: request.job_id.0,
        fetch_phase_id: request.fetch_phase_id.0,
        to_fetch: request
            .to_fetch
            .iter()
            .map(|(table, ids)| v1::TableFetchIds {
                table: Some(proto_table(table)),
                fetch_ids: ids.iter().map(|id| id.0).collect(),
            })
            .collect(),
        close_context: request.close_context,
    }
}

fn core_request(request: v1::NodeFetchRequest) -> Result<NodeFetchRequest> {
    let mut to_fetch = BTreeMap::new();
    for entry in request.to_fetch {
        let table = core_table(entry.table)?;
        if to_fetch.contains_key(&table) {
            return Err(DfqError::Execution(format!(
                "table {table} listed twice in fetch request"
            )));
        }
        to_fetch.insert(table, entry.fetch_ids.into_iter().map(FetchId).collect());
    }
    Ok(NodeFetchRequest {
        job_id: JobId(request.job_id),
        fetch_phase_id: FetchPhaseId(request.fetch_phase_id),
        to_fetch,
        close_context: request.close_context,
    })
}

fn proto_response(response: NodeFetchResponse) -> v1::NodeFetchResponse {
    v1::NodeFetchResponse {
        buckets: response
            .buckets
            .into_iter()
            .map(|(table, payload)| v1::TableBucket {
                table: Some(proto_table(&table)),
                payload,
            })
            .collect(),
    }
}

fn core_response(response: v1::NodeFetchResponse) -> Result<NodeFetchResponse> {
    let mut buckets = BTreeMap::new();
    for bucket in response.buckets {
        let table = core_table(bucket.table)?;
        if buckets.insert(table.clone(), bucket.payload).is_some() {
            return Err(DfqError::Execution(format!(
                "table {table} listed twice in fetch response"
            )));
        }
    }
    Ok(NodeFetchResponse { buckets })
}

fn to_status(err: DfqError) -> Status {
    match err {
        DfqError::InvalidConfig(msg) => Status::invalid_argument(msg),
        DfqError::Planning(msg) | DfqError::PlanningInconsistency(msg) => {
            Status::failed_precondition(msg)
        }
        e @ DfqError::ContextNotFound { .. } => Status::not_found(e.to_string()),
        DfqError::Resolution(msg) => Status::aborted(msg),
        DfqError::Transport(msg) => Status::unavailable(msg),
        DfqError::Overloaded(msg) => Status::resource_exhausted(msg),
        DfqError::Execution(msg) => Status::internal(msg),
        DfqError::Io(e) => Status::internal(e.to_string()),
        DfqError::Unsupported(msg) => Status::unimplemented(msg),
    }
}

fn from_status(status: Status, job_id: JobId, fetch_phase_id: FetchPhaseId) -> DfqError {
    let msg = status.message().to_string();
    match status.code() {
        Code::NotFound => DfqError::ContextNotFound {
            job_id,
            fetch_phase_id,
        },
        Code::ResourceExhausted => DfqError::Overloaded(msg),
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            DfqError::Transport(format!("grpc call failed: {status}"))
        }
        Code::InvalidArgument => DfqError::InvalidConfig(msg),
        Code::FailedPrecondition => DfqError::Planning(msg),
        Code::Aborted => DfqError::Resolution(msg),
        Code::Unimplemented => DfqError::Unsupported(msg),
        _ => DfqError::Execution(format!("grpc call failed: {status}")),
    }
}
