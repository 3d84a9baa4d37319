//! Distributed fetch resolution runtime.
//!
//! Node side:
//! - [`context`]: per-(job, fetch phase) contexts and their lifecycle
//! - [`node_fetch`]: the node fetch action and its admission wrapper
//! - [`reader`]: underlying row resolver boundary and an in-memory store
//!
//! Initiator side:
//! - [`coordinator`]: parallel node fetch requests and close fan-out
//! - [`projector`]: resolves deferred columns of query-phase rows
//! - [`allocations`]: fetch id routing and partition values
//!
//! Shared: [`protocol`] messages, [`streamer`] bucket codec, [`transport`]
//! adapters (in-process, and gRPC behind the `grpc` feature), [`admission`].

pub mod admission;
pub mod allocations;
pub mod context;
pub mod coordinator;
pub mod ddl;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod node_fetch;
pub mod projector;
pub mod protocol;
pub mod reader;
pub mod streamer;
pub mod transport;


pub use admission::{AdmissionPermit, RequestAdmission};
pub use allocations::{ReaderAllocation, ReaderAllocations};
pub use context::{ContextState, JobFetchContext, JobFetchContextService};
pub use coordinator::{FetchCoordinator, FetchPhaseSession, IdsByNode};
pub use ddl::{DeletePartitionTask, PartitionAdmin, UNKNOWN_ROW_COUNT};
pub use node_fetch::{NodeFetchOperation, NodeFetchService};
pub use projector::FetchProjector;
pub use protocol::{IdsByTable, NodeFetchRequest, NodeFetchResponse};
pub use reader::{FetchReader, FetchReaderFactory, InMemoryTableStore};
pub use streamer::{Streamer, TableStreamers};
pub use transport::{FetchTransport, InProcessFetchTransport};
