//! Postgres-backed event log.
//!
//! [`Store`] implements [`eventide_core::store::Backend`] on top of three
//! tables sharing one connection pool:
//!
//! - `es_streams` holds the tail version of each aggregate stream and is the
//!   row locked by conditional appends
//! - `es_events` holds every event; its `BIGSERIAL` position is the global
//!   append order
//! - `es_snapshots` holds snapshot records keyed by stream and version

mod error;

use chrono::{DateTime, Utc};
use eventide_core::{
    aggregate::INITIAL_VERSION,
    concurrency::ConcurrencyConflict,
    store::{
        AppendError, Backend, EventRecord, Headers, NonEmpty, RecordStream, SnapshotRecord,
        StreamKey,
    },
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow, types::Json};
use tokio_stream::StreamExt;

pub use crate::error::Error;

const EVENT_COLUMNS: &str =
    "aggregate_kind, aggregate_id, version, event_kind, data, headers, recorded_at";

/// A `PostgreSQL` [`Backend`].
///
/// Clones share the pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema (idempotent).
    ///
    /// Uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_streams (
                aggregate_kind TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                last_version   BIGINT NULL,
                PRIMARY KEY (aggregate_kind, aggregate_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_events (
                position       BIGSERIAL PRIMARY KEY,
                aggregate_kind TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                version        BIGINT NOT NULL,
                event_kind     TEXT NOT NULL,
                data           BYTEA NOT NULL,
                headers        JSONB NOT NULL,
                recorded_at    TIMESTAMPTZ NOT NULL,
                UNIQUE (aggregate_kind, aggregate_id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_snapshots (
                aggregate_kind TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                version        BIGINT NOT NULL,
                snapshot_type  TEXT NOT NULL,
                data           BYTEA NOT NULL,
                taken_at       TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (aggregate_kind, aggregate_id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn event_record(row: &PgRow) -> Result<EventRecord, sqlx::Error> {
    let headers: Json<Headers> = row.try_get("headers")?;
    Ok(EventRecord {
        aggregate_kind: row.try_get("aggregate_kind")?,
        aggregate_id: row.try_get("aggregate_id")?,
        version: row.try_get("version")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
        event_kind: row.try_get("event_kind")?,
        data: row.try_get("data")?,
        headers: headers.0,
    })
}

fn snapshot_record(row: &PgRow) -> Result<SnapshotRecord, sqlx::Error> {
    Ok(SnapshotRecord {
        aggregate_kind: row.try_get("aggregate_kind")?,
        aggregate_id: row.try_get("aggregate_id")?,
        version: row.try_get("version")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("taken_at")?,
        snapshot_type: row.try_get("snapshot_type")?,
        data: row.try_get("data")?,
    })
}

impl Backend for Store {
    type Error = Error;

    async fn tail_version<'a>(&'a self, key: &'a StreamKey) -> Result<Option<i64>, Self::Error> {
        let version: Option<i64> = sqlx::query_scalar(
            r"SELECT last_version FROM es_streams WHERE aggregate_kind = $1 AND aggregate_id = $2",
        )
        .bind(key.aggregate_kind())
        .bind(key.aggregate_id())
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(version)
    }

    #[tracing::instrument(
        skip(self, key, events),
        fields(stream = %key, expected_tail = ?expected_tail, events_len = events.len())
    )]
    async fn append<'a>(
        &'a self,
        key: &'a StreamKey,
        events: NonEmpty<EventRecord>,
        expected_tail: Option<i64>,
    ) -> Result<(), AppendError<Self::Error>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppendError::Store(Error::Database(e)))?;

        sqlx::query(
            r"
                INSERT INTO es_streams (aggregate_kind, aggregate_id, last_version)
                VALUES ($1, $2, NULL)
                ON CONFLICT (aggregate_kind, aggregate_id) DO NOTHING
                ",
        )
        .bind(key.aggregate_kind())
        .bind(key.aggregate_id())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppendError::Store(Error::Database(e)))?;

        let current: Option<i64> = sqlx::query_scalar(
            r"
                SELECT last_version
                FROM es_streams
                WHERE aggregate_kind = $1 AND aggregate_id = $2
                FOR UPDATE
                ",
        )
        .bind(key.aggregate_kind())
        .bind(key.aggregate_id())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppendError::Store(Error::Database(e)))?;

        if let Some(expected) = expected_tail
            && current.unwrap_or(INITIAL_VERSION) != expected
        {
            return Err(ConcurrencyConflict::new(key, expected, current).into());
        }

        let original_version = events.first().version - 1;
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO es_events ({EVENT_COLUMNS}) "));
        qb.push_values(events, |mut b, event| {
            b.push_bind(event.aggregate_kind);
            b.push_bind(event.aggregate_id);
            b.push_bind(event.version);
            b.push_bind(event.event_kind);
            b.push_bind(event.data);
            b.push_bind(Json(event.headers));
            b.push_bind(event.timestamp);
        });
        qb.push(" RETURNING version");

        let versions: Vec<i64> = qb
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| match e {
                // Overlapping versions from an unchecked writer.
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    ConcurrencyConflict::new(key, original_version, current).into()
                }
                e => AppendError::Store(Error::Database(e)),
            })?;

        let last_version = versions
            .iter()
            .max()
            .ok_or(AppendError::Store(Error::MissingReturnedVersion))?;

        sqlx::query(
            r"
                UPDATE es_streams
                SET last_version = $1
                WHERE aggregate_kind = $2 AND aggregate_id = $3
                ",
        )
        .bind(last_version)
        .bind(key.aggregate_kind())
        .bind(key.aggregate_id())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppendError::Store(Error::Database(e)))?;

        tx.commit()
            .await
            .map_err(|e| AppendError::Store(Error::Database(e)))?;

        tracing::trace!(last_version, "events appended");
        Ok(())
    }

    fn read<'a>(&'a self, key: &'a StreamKey, from_version: i64) -> RecordStream<'a, Self::Error> {
        Box::pin(async_stream::stream! {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM es_events \
                 WHERE aggregate_kind = $1 AND aggregate_id = $2 AND version >= $3 \
                 ORDER BY version ASC"
            );
            let mut rows = sqlx::query(&sql)
                .bind(key.aggregate_kind())
                .bind(key.aggregate_id())
                .bind(from_version)
                .fetch(&self.pool);
            while let Some(row) = rows.next().await {
                yield row
                    .and_then(|row| event_record(&row))
                    .map_err(Error::from);
            }
        })
    }

    fn read_all(&self) -> RecordStream<'_, Self::Error> {
        Box::pin(async_stream::stream! {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM es_events ORDER BY position ASC");
            let mut rows = sqlx::query(&sql).fetch(&self.pool);
            while let Some(row) = rows.next().await {
                yield row
                    .and_then(|row| event_record(&row))
                    .map_err(Error::from);
            }
        })
    }

    #[tracing::instrument(
        skip_all,
        fields(
            aggregate_kind = %snapshot.aggregate_kind,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version
        )
    )]
    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), Self::Error> {
        sqlx::query(
            r"
            INSERT INTO es_snapshots (aggregate_kind, aggregate_id, version, snapshot_type, data, taken_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (aggregate_kind, aggregate_id, version)
            DO UPDATE SET snapshot_type = EXCLUDED.snapshot_type,
                          data = EXCLUDED.data,
                          taken_at = EXCLUDED.taken_at
            ",
        )
        .bind(&snapshot.aggregate_kind)
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version)
        .bind(&snapshot.snapshot_type)
        .bind(&snapshot.data)
        .bind(snapshot.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn has_snapshot<'a>(&'a self, key: &'a StreamKey) -> Result<bool, Self::Error> {
        let exists: bool = sqlx::query_scalar(
            r"SELECT EXISTS (SELECT 1 FROM es_snapshots WHERE aggregate_kind = $1 AND aggregate_id = $2)",
        )
        .bind(key.aggregate_kind())
        .bind(key.aggregate_id())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn latest_snapshot<'a>(
        &'a self,
        key: &'a StreamKey,
    ) -> Result<Option<SnapshotRecord>, Self::Error> {
        let row = sqlx::query(
            r"
            SELECT aggregate_kind, aggregate_id, version, snapshot_type, data, taken_at
            FROM es_snapshots
            WHERE aggregate_kind = $1 AND aggregate_id = $2
            ORDER BY version DESC
            LIMIT 1
            ",
        )
        .bind(key.aggregate_kind())
        .bind(key.aggregate_id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(snapshot_record).transpose()?)
    }
}
