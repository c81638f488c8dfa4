//! Catalog and table reads inside a snapshot-pinned transaction

use async_trait::async_trait;
use etcd_sync_pgoutput::{Column, Relation};
use tokio_postgres::Transaction;
use tracing::debug;

use crate::connection::SnapshotTransaction;
use crate::replication::quote_ident;
use crate::ReplicationError;

pub(crate) struct PgSnapshot<'t> {
    txn: &'t Transaction<'t>,
}

impl<'t> PgSnapshot<'t> {
    pub(crate) fn new(txn: &'t Transaction<'t>) -> Self {
        Self { txn }
    }

    async fn relation(&self, namespace: &str, name: &str) -> Result<Relation, ReplicationError> {
        let oid: i64 = self
            .txn
            .query_one(
                "SELECT (quote_ident($1) || '.' || quote_ident($2))::regclass::oid::int8",
                &[&namespace, &name],
            )
            .await?
            .get(0);

        let rows = self
            .txn
            .query(
                "SELECT a.attname::text, a.atttypid::int8, a.atttypmod, \
                        COALESCE(i.indisprimary, false) \
                 FROM pg_attribute a \
                 LEFT JOIN pg_index i \
                   ON i.indrelid = a.attrelid AND i.indisprimary AND a.attnum = ANY(i.indkey) \
                 WHERE a.attrelid = $1::int8::oid AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&oid],
            )
            .await?;

        let columns = rows
            .iter()
            .map(|row| {
                let type_oid: i64 = row.get(1);
                Column {
                    name: row.get(0),
                    type_oid: type_oid as u32,
                    type_modifier: row.get(2),
                    is_key: row.get(3),
                }
            })
            .collect::<Vec<_>>();

        Ok(Relation {
            id: oid as u32,
            namespace: namespace.to_string(),
            name: name.to_string(),
            replica_identity: b'd',
            columns,
        })
    }
}

#[async_trait]
impl SnapshotTransaction for PgSnapshot<'_> {
    async fn tables(&mut self, publication: &str) -> Result<Vec<Relation>, ReplicationError> {
        let rows = self
            .txn
            .query(
                "SELECT schemaname::text, tablename::text FROM pg_publication_tables \
                 WHERE pubname = $1 ORDER BY schemaname, tablename",
                &[&publication],
            )
            .await?;

        let mut relations = Vec::with_capacity(rows.len());
        for row in rows {
            let namespace: String = row.get(0);
            let name: String = row.get(1);
            let relation = self.relation(&namespace, &name).await?;
            debug!(
                "Snapshot table {} with {} columns",
                relation.qualified_name(),
                relation.columns.len()
            );
            relations.push(relation);
        }
        Ok(relations)
    }

    async fn rows(
        &mut self,
        relation: &Relation,
    ) -> Result<Vec<Vec<Option<String>>>, ReplicationError> {
        if relation.columns.is_empty() {
            return Ok(Vec::new());
        }

        let select_list = relation
            .columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT {select_list} FROM {}.{}",
            quote_ident(&relation.namespace),
            quote_ident(&relation.name)
        );

        let rows = self.txn.query(&query, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                (0..relation.columns.len())
                    .map(|i| row.get::<_, Option<String>>(i))
                    .collect()
            })
            .collect())
    }
}
