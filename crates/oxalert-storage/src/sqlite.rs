use crate::error::Result;
use crate::InstanceStore;
use async_trait::async_trait;
use oxalert_common::types::{OrgId, RuleKey};
use oxalert_state::state::AlertInstance;
use rusqlite::{params, Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const ALERT_INSTANCES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alert_instances (
    org_id INTEGER NOT NULL,
    rule_uid TEXT NOT NULL,
    labels_hash INTEGER NOT NULL,
    state TEXT NOT NULL,
    instance_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, rule_uid, labels_hash)
);
CREATE INDEX IF NOT EXISTS idx_alert_instances_org ON alert_instances(org_id);
";

/// Alert instances persisted in a single SQLite database under the data
/// directory. Each row stores the full instance as JSON next to the key
/// columns used for deletes and listing.
pub struct SqliteInstanceStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteInstanceStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("alert_instances.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(ALERT_INSTANCES_SCHEMA)?;
        tracing::info!(path = %db_path.display(), "Initialized alert instance store");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn upsert(tx: &Transaction<'_>, inst: &AlertInstance) -> Result<()> {
        let json = serde_json::to_string(inst)?;
        tx.execute(
            "INSERT OR REPLACE INTO alert_instances
                (org_id, rule_uid, labels_hash, state, instance_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                inst.rule_key.org_id,
                inst.rule_key.uid,
                inst.labels_hash as i64,
                inst.state.to_string(),
                json,
                inst.last_evaluated_at.timestamp(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn save_instances(&self, instances: &[AlertInstance]) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for inst in instances {
            Self::upsert(&tx, inst)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_instances(&self, key: &RuleKey, labels_hashes: &[u64]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for hash in labels_hashes {
            tx.execute(
                "DELETE FROM alert_instances WHERE org_id = ?1 AND rule_uid = ?2 AND labels_hash = ?3",
                params![key.org_id, key.uid, *hash as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_rule_instances(&self, key: &RuleKey) -> Result<()> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM alert_instances WHERE org_id = ?1 AND rule_uid = ?2",
            params![key.org_id, key.uid],
        )?;
        tracing::debug!(rule = %key, deleted, "Deleted rule instances");
        Ok(())
    }

    async fn full_sync(&self, org_id: OrgId, instances: &[AlertInstance]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM alert_instances WHERE org_id = ?1", params![org_id])?;
        for inst in instances.iter().filter(|i| i.rule_key.org_id == org_id) {
            Self::upsert(&tx, inst)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn fetch_org_ids(&self) -> Result<Vec<OrgId>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT org_id FROM alert_instances ORDER BY org_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut orgs = Vec::new();
        for row in rows {
            orgs.push(row?);
        }
        Ok(orgs)
    }

    async fn list_instances(&self, org_id: OrgId) -> Result<Vec<AlertInstance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT instance_json FROM alert_instances WHERE org_id = ?1 ORDER BY rule_uid, labels_hash",
        )?;
        let rows = stmt.query_map(params![org_id], |row| row.get::<_, String>(0))?;
        let mut instances = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<AlertInstance>(&json) {
                Ok(inst) => instances.push(inst),
                Err(e) => {
                    tracing::warn!(org_id, error = %e, "Skipping unreadable alert instance row")
                }
            }
        }
        Ok(instances)
    }
}
