//! One-shot delete-partition task.
//!
//! Administrative tasks run alongside fetch phases on the same node executor
//! but are sheddable. A successful delete reports the unknown row count
//! sentinel as its single result row.

use std::sync::Arc;

use async_trait::async_trait;
use dfq_common::{DfqError, Result, Row, ScalarValue, TableIdent};
use tracing::info;

use crate::admission::RequestAdmission;

/// Row count reported by DDL tasks that cannot count affected rows.
pub const UNKNOWN_ROW_COUNT: i64 = -1;

pub const DELETE_PARTITION_ACTION: &str = "dfq/ddl/delete_partition";

#[async_trait]
/// Cluster-level partition administration.
pub trait PartitionAdmin: Send + Sync {
    /// Delete partitions by index name. With `lenient`, already missing
    /// partitions are not an error.
    async fn delete_partitions(&self, partition_indices: &[String], lenient: bool) -> Result<()>;
}

pub struct DeletePartitionTask {
    admin: Arc<dyn PartitionAdmin>,
    table: TableIdent,
    partition_index: String,
}

impl DeletePartitionTask {
    pub fn new(admin: Arc<dyn PartitionAdmin>, table: TableIdent, partition_index: String) -> Self {
        Self {
            admin,
            table,
            partition_index,
        }
    }

    /// Delete the partition once; errors are returned as-is, without retry.
    pub async fn execute(&self, admission: &RequestAdmission) -> Result<Row> {
        let _permit = admission.admit(DELETE_PARTITION_ACTION, false)?;
        self.admin
            .delete_partitions(std::slice::from_ref(&self.partition_index), true)
            .await?;
        info!(
            table = %self.table,
            partition = %self.partition_index,
            "partition deleted"
        );
        Ok(vec![ScalarValue::Int64(UNKNOWN_ROW_COUNT)])
    }

    pub fn execute_bulk(&self) -> Result<Vec<Row>> {
        Err(DfqError::Unsupported(
            "delete partition cannot be executed as a bulk operation".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use dfq_common::NodeId;

    use super::*;

    #[derive(Default)]
    struct RecordingAdmin {
        calls: Mutex<Vec<(Vec<String>, bool)>>,
        fail: bool,
    }

    #[async_trait]
    impl PartitionAdmin for RecordingAdmin {
        async fn delete_partitions(&self, partition_indices: &[String], lenient: bool) -> Result<()> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((partition_indices.to_vec(), lenient));
            if self.fail {
                return Err(DfqError::Execution("cluster state update rejected".to_string()));
            }
            Ok(())
        }
    }

    fn task(admin: Arc<RecordingAdmin>) -> DeletePartitionTask {
        DeletePartitionTask::new(
            admin,
            TableIdent::new("doc", "events"),
            ".partitioned.events.0400".to_string(),
        )
    }

    #[tokio::test]
    async fn success_maps_to_unknown_row_count() {
        let admin = Arc::new(RecordingAdmin::default());
        let admission = RequestAdmission::new(NodeId::new("n1"), 2);
        let row = task(Arc::clone(&admin))
            .execute(&admission)
            .await
            .expect("delete");
        assert_eq!(row, vec![ScalarValue::Int64(-1)]);
        let calls = admin.calls.lock().expect("calls lock");
        assert_eq!(
            calls.as_slice(),
            &[(vec![".partitioned.events.0400".to_string()], true)]
        );
    }

    #[tokio::test]
    async fn failure_is_surfaced_once_and_bulk_is_unsupported() {
        let admin = Arc::new(RecordingAdmin {
            fail: true,
            ..RecordingAdmin::default()
        });
        let admission = RequestAdmission::new(NodeId::new("n1"), 2);
        let t = task(Arc::clone(&admin));
        assert!(matches!(
            t.execute(&admission).await,
            Err(DfqError::Execution(_))
        ));
        assert_eq!(admin.calls.lock().expect("calls lock").len(), 1);
        assert!(matches!(t.execute_bulk(), Err(DfqError::Unsupported(_))));
    }

    #[tokio::test]
    async fn is_shed_when_executor_is_full() {
        let admin = Arc::new(RecordingAdmin::default());
        let admission = RequestAdmission::new(NodeId::new("n1"), 1);
        let _busy = admission.admit("other", false).expect("slot");
        assert!(matches!(
            task(Arc::clone(&admin)).execute(&admission).await,
            Err(DfqError::Overloaded(_))
        ));
        assert!(admin.calls.lock().expect("calls lock").is_empty());
    }
}
