//! Postgres-backed store. Plain runtime queries, no compile-time
//! checking, so the schema file stays the single source of truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::{Executor, Transaction};
use tracing::info;

use crate::config::DbConfig;
use crate::models::{
    Alert, HistoryRecord, Labels, MatchCondition, Severity, Status, SuppressionRule,
};
use crate::store::{Store, StoreError, Txn};

const SCHEMA: &str = include_str!("schema.sql");

const ALERT_COLUMNS: &str = "id, name, source, scope, entity, device, owner, team, severity, \
     status, start_time, last_active, auto_clear_at, labels, auto_clear, agg_id, is_aggregate";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect, apply the statement lock timeout to every connection,
    /// and bootstrap the schema. Any failure here is fatal at startup.
    pub async fn connect(cfg: &DbConfig) -> Result<Self, StoreError> {
        let (host, port) = parse_addr(&cfg.addr)?;
        let url = format!(
            "postgres://{}:{}@{}:{}/{}",
            cfg.username, cfg.password, host, port, cfg.db_name
        );
        let lock_timeout = format!("SET lock_timeout = {}", cfg.timeout.as_millis());
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(cfg.timeout)
            .after_connect(move |conn, _meta| {
                let stmt = lock_timeout.clone();
                Box::pin(async move {
                    conn.execute(stmt.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await?;
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                pool.execute(stmt).await?;
            }
        }
        info!("connected to database at {}", cfg.addr);
        Ok(PgStore { pool })
    }
}

fn parse_addr(addr: &str) -> Result<(&str, u16), StoreError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| StoreError::Internal(format!("invalid db addr: {addr}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| StoreError::Internal(format!("invalid db port in addr: {addr}")))?;
    let host = if host.is_empty() { "localhost" } else { host };
    Ok((host, port))
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Txn>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTxn { tx }))
    }
}

struct PgTxn {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    name: String,
    source: String,
    scope: String,
    entity: String,
    device: Option<String>,
    owner: Option<String>,
    team: String,
    severity: i16,
    status: i16,
    start_time: DateTime<Utc>,
    last_active: DateTime<Utc>,
    auto_clear_at: Option<DateTime<Utc>>,
    labels: Json<Labels>,
    auto_clear: bool,
    agg_id: i64,
    is_aggregate: bool,
}

impl TryFrom<AlertRow> for Alert {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Alert, StoreError> {
        Ok(Alert {
            id: row.id,
            name: row.name,
            source: row.source,
            scope: row.scope,
            entity: row.entity,
            device: row.device,
            owner: row.owner,
            team: row.team,
            severity: Severity::from_i16(row.severity)
                .ok_or_else(|| StoreError::Internal(format!("bad severity {}", row.severity)))?,
            status: Status::from_i16(row.status)
                .ok_or_else(|| StoreError::Internal(format!("bad status {}", row.status)))?,
            start_time: row.start_time,
            last_active: row.last_active,
            auto_clear_at: row.auto_clear_at,
            labels: row.labels.0,
            auto_clear: row.auto_clear,
            agg_id: row.agg_id,
            is_aggregate: row.is_aggregate,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    name: String,
    entities: Json<Labels>,
    match_condition: i16,
    reason: String,
    creator: String,
    created_at: DateTime<Utc>,
    duration_secs: i64,
}

impl TryFrom<RuleRow> for SuppressionRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<SuppressionRule, StoreError> {
        let match_condition = match row.match_condition {
            1 => MatchCondition::All,
            2 => MatchCondition::Any,
            other => {
                return Err(StoreError::Internal(format!(
                    "bad match condition {other}"
                )));
            }
        };
        Ok(SuppressionRule {
            id: row.id,
            name: row.name,
            entities: row.entities.0,
            match_condition,
            reason: row.reason,
            creator: row.creator,
            created_at: row.created_at,
            duration: std::time::Duration::from_secs(row.duration_secs.max(0) as u64),
        })
    }
}

fn match_condition_i16(c: MatchCondition) -> i16 {
    match c {
        MatchCondition::All => 1,
        MatchCondition::Any => 2,
    }
}

fn alerts_from_rows(rows: Vec<AlertRow>) -> Result<Vec<Alert>, StoreError> {
    rows.into_iter().map(Alert::try_from).collect()
}

#[async_trait]
impl Txn for PgTxn {
    async fn insert_alert(&mut self, alert: &Alert) -> Result<i64, StoreError> {
        let sql = "INSERT INTO alerts (name, source, scope, entity, device, owner, team, \
             severity, status, start_time, last_active, auto_clear_at, labels, auto_clear, \
             agg_id, is_aggregate) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             RETURNING id";
        let id: i64 = sqlx::query_scalar(sql)
            .bind(&alert.name)
            .bind(&alert.source)
            .bind(&alert.scope)
            .bind(&alert.entity)
            .bind(&alert.device)
            .bind(&alert.owner)
            .bind(&alert.team)
            .bind(alert.severity.as_i16())
            .bind(alert.status.as_i16())
            .bind(alert.start_time)
            .bind(alert.last_active)
            .bind(alert.auto_clear_at)
            .bind(Json(&alert.labels))
            .bind(alert.auto_clear)
            .bind(alert.agg_id)
            .bind(alert.is_aggregate)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                    format!("alert {}:{} already open", alert.name, alert.entity),
                ),
                _ => StoreError::Database(e),
            })?;
        Ok(id)
    }

    async fn update_alert(&mut self, alert: &Alert) -> Result<(), StoreError> {
        let sql = "UPDATE alerts SET name = $1, source = $2, scope = $3, entity = $4, \
             device = $5, owner = $6, team = $7, severity = $8, status = $9, start_time = $10, \
             last_active = $11, auto_clear_at = $12, labels = $13, auto_clear = $14, \
             agg_id = $15, is_aggregate = $16 WHERE id = $17";
        sqlx::query(sql)
            .bind(&alert.name)
            .bind(&alert.source)
            .bind(&alert.scope)
            .bind(&alert.entity)
            .bind(&alert.device)
            .bind(&alert.owner)
            .bind(&alert.team)
            .bind(alert.severity.as_i16())
            .bind(alert.status.as_i16())
            .bind(alert.start_time)
            .bind(alert.last_active)
            .bind(alert.auto_clear_at)
            .bind(Json(&alert.labels))
            .bind(alert.auto_clear)
            .bind(alert.agg_id)
            .bind(alert.is_aggregate)
            .bind(alert.id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn set_status(&mut self, id: i64, status: Status) -> Result<(), StoreError> {
        sqlx::query("UPDATE alerts SET status = $1 WHERE id = $2")
            .bind(status.as_i16())
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_last_active(
        &mut self,
        ids: &[i64],
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE alerts SET last_active = $1 WHERE id = ANY($2)")
            .bind(ts)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_alert(&mut self, id: i64) -> Result<Option<Alert>, StoreError> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1");
        let row = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Alert::try_from).transpose()
    }

    async fn get_alert_by_identity(
        &mut self,
        name: &str,
        entity: &str,
        device: Option<&str>,
    ) -> Result<Option<Alert>, StoreError> {
        let row = match device {
            Some(device) => {
                let sql = format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts \
                     WHERE name = $1 AND entity = $2 AND device = $3 AND status NOT IN (3, 4) \
                     ORDER BY id DESC LIMIT 1"
                );
                sqlx::query_as::<_, AlertRow>(&sql)
                    .bind(name)
                    .bind(entity)
                    .bind(device)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts \
                     WHERE name = $1 AND entity = $2 AND device IS NULL AND status NOT IN (3, 4) \
                     ORDER BY id DESC LIMIT 1"
                );
                sqlx::query_as::<_, AlertRow>(&sql)
                    .bind(name)
                    .bind(entity)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
        };
        row.map(Alert::try_from).transpose()
    }

    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE status IN (1, 2) AND auto_clear_at IS NOT NULL AND auto_clear_at < $1 \
             ORDER BY id"
        );
        let rows = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await?;
        alerts_from_rows(rows)
    }

    async fn select_unowned(&mut self) -> Result<Vec<Alert>, StoreError> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE status = 1 AND owner IS NULL ORDER BY id"
        );
        let rows = sqlx::query_as::<_, AlertRow>(&sql)
            .fetch_all(&mut *self.tx)
            .await?;
        alerts_from_rows(rows)
    }

    async fn select_active_by_name(&mut self, name: &str) -> Result<Vec<Alert>, StoreError> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE status = 1 AND name = $1 ORDER BY id"
        );
        let rows = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(name)
            .fetch_all(&mut *self.tx)
            .await?;
        alerts_from_rows(rows)
    }

    async fn insert_record(&mut self, alert_id: i64, event: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO alert_history (alert_id, ts, event) VALUES ($1, $2, $3)")
            .bind(alert_id)
            .bind(Utc::now())
            .bind(event)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn select_records(&mut self, alert_id: i64) -> Result<Vec<HistoryRecord>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct RecordRow {
            id: i64,
            alert_id: i64,
            ts: DateTime<Utc>,
            event: String,
        }
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT id, alert_id, ts, event FROM alert_history WHERE alert_id = $1 ORDER BY id",
        )
        .bind(alert_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| HistoryRecord {
                id: r.id,
                alert_id: r.alert_id,
                timestamp: r.ts,
                event: r.event,
            })
            .collect())
    }

    async fn insert_rule(&mut self, rule: &SuppressionRule) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO suppression_rules \
             (name, entities, match_condition, reason, creator, created_at, duration_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&rule.name)
        .bind(Json(&rule.entities))
        .bind(match_condition_i16(rule.match_condition))
        .bind(&rule.reason)
        .bind(&rule.creator)
        .bind(rule.created_at)
        .bind(rule.duration.as_secs() as i64)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn delete_rule(&mut self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM suppression_rules WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn select_rules(&mut self) -> Result<Vec<SuppressionRule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT id, name, entities, match_condition, reason, creator, created_at, \
             duration_secs FROM suppression_rules ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(SuppressionRule::try_from).collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parsing() {
        assert_eq!(parse_addr("db.example.net:5432").unwrap(), ("db.example.net", 5432));
        assert_eq!(parse_addr(":5432").unwrap(), ("localhost", 5432));
        assert!(parse_addr("no-port").is_err());
        assert!(parse_addr("host:notaport").is_err());
    }
}
