//! SQLite-backed stores.
//!
//! Two logical stores share one database file: the operational store
//! (groups, tokens, channels, model configs, options) and the log store
//! (request logs plus hour/minute summaries). Summary upserts merge
//! additively so the write-behind flusher can retry without double
//! counting a key's prior state.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::entity::{
    Channel, ChannelKind, ChannelStatus, Group, GroupStatus, ModelConfig, Mode, Token, TokenStatus,
};
use crate::model::log::RequestLog;
use crate::model::summary::{GroupSummaryKey, SummaryData, SummaryKey};
use crate::model::usage::Usage;

pub type StoreResult<T> = Result<T, rusqlite::Error>;

pub struct Store {
    conn: Mutex<Connection>,
}

static GLOBAL: OnceLock<Arc<Store>> = OnceLock::new();

/// Open (or create) the global store under the data directory.
pub fn init() -> Arc<Store> {
    GLOBAL
        .get_or_init(|| {
            let mut path = crate::config::data_dir();
            path.push("airelay.db");
            Arc::new(Store::open(&path).expect("open operational store"))
        })
        .clone()
}

pub fn global() -> Arc<Store> {
    init()
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "temp_store", "MEMORY").ok();
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'enabled',
                used_amount REAL NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                balance REAL NOT NULL DEFAULT 0,
                max_input_tokens INTEGER NOT NULL DEFAULT 0,
                rpm INTEGER NOT NULL DEFAULT 0,
                tpm INTEGER NOT NULL DEFAULT 0,
                balance_alert_threshold REAL,
                allowed_models TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'enabled',
                quota REAL NOT NULL DEFAULT 0,
                used_amount REAL NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                allowed_models TEXT NOT NULL DEFAULT '[]',
                allowed_subnets TEXT NOT NULL DEFAULT '[]',
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_group ON tokens(group_id);
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'enabled',
                base_url TEXT NOT NULL,
                key TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 1,
                models TEXT NOT NULL DEFAULT '[]',
                model_mapping TEXT NOT NULL DEFAULT '{}',
                plugin TEXT NOT NULL DEFAULT 'null',
                used_amount REAL NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS model_configs (
                model TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                price TEXT NOT NULL DEFAULT '{}',
                max_context_tokens INTEGER NOT NULL DEFAULT 0,
                max_output_tokens INTEGER NOT NULL DEFAULT 0,
                plugin TEXT NOT NULL DEFAULT 'null'
            );
            CREATE TABLE IF NOT EXISTS options (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS request_logs (
                request_id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                token_id INTEGER NOT NULL,
                token_name TEXT NOT NULL,
                channel_id INTEGER NOT NULL,
                model TEXT NOT NULL,
                actual_model TEXT NOT NULL,
                mode TEXT NOT NULL,
                code INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                ttfb_ms INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                usage TEXT NOT NULL,
                amount REAL NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                downstream_result INTEGER NOT NULL DEFAULT 0,
                upstream_id TEXT,
                request_detail TEXT,
                response_detail TEXT,
                client_ip TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_created
                ON request_logs(created_at DESC);",
        )?;
        for table in ["summaries", "summaries_minute"] {
            conn.execute_batch(&channel_summary_schema(table))?;
        }
        for table in ["group_summaries", "group_summaries_minute"] {
            conn.execute_batch(&group_summary_schema(table))?;
        }
        Ok(())
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub fn upsert_group(&self, group: &Group) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO groups(id, status, used_amount, request_count, balance,
                                max_input_tokens, rpm, tpm, balance_alert_threshold,
                                allowed_models)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT(id) DO UPDATE SET
                status=excluded.status,
                used_amount=excluded.used_amount,
                request_count=excluded.request_count,
                balance=excluded.balance,
                max_input_tokens=excluded.max_input_tokens,
                rpm=excluded.rpm,
                tpm=excluded.tpm,
                balance_alert_threshold=excluded.balance_alert_threshold,
                allowed_models=excluded.allowed_models",
            params![
                group.id,
                status_str(group.status),
                group.used_amount,
                group.request_count,
                group.balance,
                group.max_input_tokens,
                group.rpm,
                group.tpm,
                group.balance_alert_threshold,
                serde_json::to_string(&group.allowed_models).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT id, status, used_amount, request_count, balance, max_input_tokens,
                    rpm, tpm, balance_alert_threshold, allowed_models
             FROM groups WHERE id=?1",
            params![id],
            row_to_group,
        )
        .optional()
    }

    pub fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, status, used_amount, request_count, balance, max_input_tokens,
                    rpm, tpm, balance_alert_threshold, allowed_models
             FROM groups",
        )?;
        let rows = stmt.query_map([], row_to_group)?;
        rows.collect()
    }

    /// Row-level increment used by the consumption flusher.
    pub fn add_group_consumption(
        &self,
        group_id: &str,
        amount: f64,
        request_count: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE groups SET used_amount = used_amount + ?2,
                               balance = balance - ?2,
                               request_count = request_count + ?3
             WHERE id = ?1",
            params![group_id, amount, request_count],
        )?;
        Ok(())
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    pub fn insert_token(&self, token: &Token) -> StoreResult<i64> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO tokens(group_id, key, name, status, quota, used_amount,
                                request_count, allowed_models, allowed_subnets, expires_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                token.group_id,
                token.key,
                token.name,
                token_status_str(token.status),
                token.quota,
                token.used_amount,
                token.request_count,
                serde_json::to_string(&token.allowed_models).unwrap_or_default(),
                serde_json::to_string(&token.allowed_subnets).unwrap_or_default(),
                token.expires_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_token_by_key(&self, key: &str) -> StoreResult<Option<Token>> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT id, group_id, key, name, status, quota, used_amount, request_count,
                    allowed_models, allowed_subnets, expires_at
             FROM tokens WHERE key=?1",
            params![key],
            row_to_token,
        )
        .optional()
    }

    pub fn get_token(&self, id: i64) -> StoreResult<Option<Token>> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT id, group_id, key, name, status, quota, used_amount, request_count,
                    allowed_models, allowed_subnets, expires_at
             FROM tokens WHERE id=?1",
            params![id],
            row_to_token,
        )
        .optional()
    }

    pub fn count_group_tokens(&self, group_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT COUNT(*) FROM tokens WHERE group_id=?1",
            params![group_id],
            |row| row.get(0),
        )
    }

    pub fn add_token_consumption(
        &self,
        token_id: i64,
        amount: f64,
        request_count: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE tokens SET used_amount = used_amount + ?2,
                               request_count = request_count + ?3
             WHERE id = ?1",
            params![token_id, amount, request_count],
        )?;
        Ok(())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub fn insert_channel(&self, channel: &Channel) -> StoreResult<i64> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO channels(name, kind, status, base_url, key, priority, weight,
                                  models, model_mapping, plugin)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                channel.name,
                channel.kind.as_str(),
                channel.status.as_str(),
                channel.base_url,
                channel.key,
                channel.priority,
                channel.weight,
                serde_json::to_string(&channel.models).unwrap_or_default(),
                serde_json::to_string(&channel.model_mapping).unwrap_or_default(),
                channel.plugin.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_channels(&self) -> StoreResult<Vec<Channel>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, status, base_url, key, priority, weight,
                    models, model_mapping, plugin
             FROM channels ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_channel)?;
        rows.collect()
    }

    pub fn get_channel(&self, id: i64) -> StoreResult<Option<Channel>> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT id, name, kind, status, base_url, key, priority, weight,
                    models, model_mapping, plugin
             FROM channels WHERE id=?1",
            params![id],
            row_to_channel,
        )
        .optional()
    }

    pub fn set_channel_status(&self, id: i64, status: ChannelStatus) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE channels SET status=?2 WHERE id=?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn add_channel_consumption(
        &self,
        channel_id: i64,
        amount: f64,
        request_count: i64,
        retry_count: i64,
    ) -> StoreResult<()> {
        // File-defined channels (negative ids) have no row to update.
        if channel_id < 0 {
            return Ok(());
        }
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE channels SET used_amount = used_amount + ?2,
                                 request_count = request_count + ?3 + ?4
             WHERE id = ?1",
            params![channel_id, amount, request_count, retry_count],
        )?;
        Ok(())
    }

    pub fn channel_used_amount(&self, id: i64) -> StoreResult<f64> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT used_amount FROM channels WHERE id=?1",
            params![id],
            |row| row.get(0),
        )
    }

    // ========================================================================
    // Model configs and options
    // ========================================================================

    pub fn upsert_model_config(&self, config: &ModelConfig) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO model_configs(model, mode, price, max_context_tokens,
                                       max_output_tokens, plugin)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(model) DO UPDATE SET
                mode=excluded.mode,
                price=excluded.price,
                max_context_tokens=excluded.max_context_tokens,
                max_output_tokens=excluded.max_output_tokens,
                plugin=excluded.plugin",
            params![
                config.model,
                config.mode.as_str(),
                serde_json::to_string(&config.price).unwrap_or_default(),
                config.max_context_tokens,
                config.max_output_tokens,
                config.plugin.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn list_model_configs(&self) -> StoreResult<Vec<ModelConfig>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT model, mode, price, max_context_tokens, max_output_tokens, plugin
             FROM model_configs",
        )?;
        let rows = stmt.query_map([], row_to_model_config)?;
        rows.collect()
    }

    pub fn get_option(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT value FROM options WHERE key=?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_option(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO options(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ========================================================================
    // Request logs
    // ========================================================================

    pub fn insert_log(&self, log: &RequestLog) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT OR REPLACE INTO request_logs(
                request_id, group_id, token_id, token_name, channel_id, model,
                actual_model, mode, code, created_at, ttfb_ms, latency_ms, usage,
                amount, retry_count, downstream_result, upstream_id,
                request_detail, response_detail, client_ip)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            params![
                log.request_id,
                log.group_id,
                log.token_id,
                log.token_name,
                log.channel_id,
                log.model,
                log.actual_model,
                log.mode.as_str(),
                log.code,
                log.created_at,
                log.ttfb_ms,
                log.latency_ms,
                serde_json::to_string(&log.usage).unwrap_or_default(),
                log.amount,
                log.retry_count,
                log.downstream_result as i64,
                log.upstream_id,
                log.request_detail,
                log.response_detail,
                log.client_ip,
            ],
        )?;
        Ok(())
    }

    pub fn count_logs(&self) -> StoreResult<i64> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row("SELECT COUNT(*) FROM request_logs", [], |row| row.get(0))
    }

    // ========================================================================
    // Summaries
    // ========================================================================

    pub fn upsert_summary(
        &self,
        table: SummaryTable,
        key: &SummaryKey,
        data: &SummaryData,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        let sql = format!(
            "INSERT INTO {table} (channel_id, model, bucket, {DATA_COLUMNS})
             VALUES (?1, ?2, ?3, {DATA_PLACEHOLDERS})
             ON CONFLICT(channel_id, model, bucket) DO UPDATE SET {DATA_ADD}",
            table = table.channel_table(),
        );
        let (u, c) = (&data.usage, &data.counts);
        conn.execute(
            &sql,
            params![
                key.channel_id,
                key.model,
                key.bucket,
                u.input_tokens,
                u.image_input_tokens,
                u.audio_input_tokens,
                u.output_tokens,
                u.image_output_tokens,
                u.cached_tokens,
                u.cache_creation_tokens,
                u.reasoning_tokens,
                u.total_tokens,
                u.web_search_count,
                c.total,
                c.success,
                c.c4xx,
                c.c5xx,
                c.c429,
                c.c400,
                c.c500,
                c.cache_hit,
                c.web_search,
                data.retry_count,
                data.ttfb_ms_total,
                data.latency_ms_total,
                data.used_amount,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_group_summary(
        &self,
        table: SummaryTable,
        key: &GroupSummaryKey,
        data: &SummaryData,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        let sql = format!(
            "INSERT INTO {table} (group_id, token_name, model, bucket, {DATA_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, {DATA_PLACEHOLDERS_4})
             ON CONFLICT(group_id, token_name, model, bucket) DO UPDATE SET {DATA_ADD}",
            table = table.group_table(),
        );
        let (u, c) = (&data.usage, &data.counts);
        conn.execute(
            &sql,
            params![
                key.group_id,
                key.token_name,
                key.model,
                key.bucket,
                u.input_tokens,
                u.image_input_tokens,
                u.audio_input_tokens,
                u.output_tokens,
                u.image_output_tokens,
                u.cached_tokens,
                u.cache_creation_tokens,
                u.reasoning_tokens,
                u.total_tokens,
                u.web_search_count,
                c.total,
                c.success,
                c.c4xx,
                c.c5xx,
                c.c429,
                c.c400,
                c.c500,
                c.cache_hit,
                c.web_search,
                data.retry_count,
                data.ttfb_ms_total,
                data.latency_ms_total,
                data.used_amount,
            ],
        )?;
        Ok(())
    }

    pub fn get_summary(
        &self,
        table: SummaryTable,
        key: &SummaryKey,
    ) -> StoreResult<Option<SummaryData>> {
        let conn = self.conn.lock().expect("store lock");
        let sql = format!(
            "SELECT {DATA_COLUMNS} FROM {table}
             WHERE channel_id=?1 AND model=?2 AND bucket=?3",
            table = table.channel_table(),
        );
        conn.query_row(&sql, params![key.channel_id, key.model, key.bucket], row_to_summary)
            .optional()
    }

    pub fn get_group_summary(
        &self,
        table: SummaryTable,
        key: &GroupSummaryKey,
    ) -> StoreResult<Option<SummaryData>> {
        let conn = self.conn.lock().expect("store lock");
        let sql = format!(
            "SELECT {DATA_COLUMNS} FROM {table}
             WHERE group_id=?1 AND token_name=?2 AND model=?3 AND bucket=?4",
            table = table.group_table(),
        );
        conn.query_row(
            &sql,
            params![key.group_id, key.token_name, key.model, key.bucket],
            row_to_summary,
        )
        .optional()
    }
}

/// Hour vs minute granularity selector for the summary tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryTable {
    Hour,
    Minute,
}

impl SummaryTable {
    fn channel_table(&self) -> &'static str {
        match self {
            SummaryTable::Hour => "summaries",
            SummaryTable::Minute => "summaries_minute",
        }
    }

    fn group_table(&self) -> &'static str {
        match self {
            SummaryTable::Hour => "group_summaries",
            SummaryTable::Minute => "group_summaries_minute",
        }
    }
}

const DATA_COLUMNS: &str = "input_tokens, image_input_tokens, audio_input_tokens, \
    output_tokens, image_output_tokens, cached_tokens, cache_creation_tokens, \
    reasoning_tokens, total_tokens, web_search_count, \
    count_total, count_success, count_4xx, count_5xx, count_429, count_400, \
    count_500, count_cache_hit, count_web_search, \
    retry_count, ttfb_ms_total, latency_ms_total, used_amount";

const DATA_PLACEHOLDERS: &str = "?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26";

const DATA_PLACEHOLDERS_4: &str = "?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27";

const DATA_ADD: &str = "\
    input_tokens=input_tokens+excluded.input_tokens, \
    image_input_tokens=image_input_tokens+excluded.image_input_tokens, \
    audio_input_tokens=audio_input_tokens+excluded.audio_input_tokens, \
    output_tokens=output_tokens+excluded.output_tokens, \
    image_output_tokens=image_output_tokens+excluded.image_output_tokens, \
    cached_tokens=cached_tokens+excluded.cached_tokens, \
    cache_creation_tokens=cache_creation_tokens+excluded.cache_creation_tokens, \
    reasoning_tokens=reasoning_tokens+excluded.reasoning_tokens, \
    total_tokens=total_tokens+excluded.total_tokens, \
    web_search_count=web_search_count+excluded.web_search_count, \
    count_total=count_total+excluded.count_total, \
    count_success=count_success+excluded.count_success, \
    count_4xx=count_4xx+excluded.count_4xx, \
    count_5xx=count_5xx+excluded.count_5xx, \
    count_429=count_429+excluded.count_429, \
    count_400=count_400+excluded.count_400, \
    count_500=count_500+excluded.count_500, \
    count_cache_hit=count_cache_hit+excluded.count_cache_hit, \
    count_web_search=count_web_search+excluded.count_web_search, \
    retry_count=retry_count+excluded.retry_count, \
    ttfb_ms_total=ttfb_ms_total+excluded.ttfb_ms_total, \
    latency_ms_total=latency_ms_total+excluded.latency_ms_total, \
    used_amount=used_amount+excluded.used_amount";

fn channel_summary_schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            channel_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            bucket INTEGER NOT NULL,
            {cols},
            PRIMARY KEY (channel_id, model, bucket)
        );",
        cols = data_column_defs(),
    )
}

fn group_summary_schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            group_id TEXT NOT NULL,
            token_name TEXT NOT NULL,
            model TEXT NOT NULL,
            bucket INTEGER NOT NULL,
            {cols},
            PRIMARY KEY (group_id, token_name, model, bucket)
        );",
        cols = data_column_defs(),
    )
}

fn data_column_defs() -> String {
    DATA_COLUMNS
        .split(", ")
        .map(|col| {
            let col = col.trim();
            if col == "used_amount" {
                format!("{col} REAL NOT NULL DEFAULT 0")
            } else {
                format!("{col} INTEGER NOT NULL DEFAULT 0")
            }
        })
        .collect::<Vec<_>>()
        .join(",\n            ")
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn status_str(status: GroupStatus) -> &'static str {
    match status {
        GroupStatus::Enabled => "enabled",
        GroupStatus::Disabled => "disabled",
        GroupStatus::Internal => "internal",
    }
}

fn parse_group_status(raw: &str) -> GroupStatus {
    match raw {
        "disabled" => GroupStatus::Disabled,
        "internal" => GroupStatus::Internal,
        _ => GroupStatus::Enabled,
    }
}

fn token_status_str(status: TokenStatus) -> &'static str {
    match status {
        TokenStatus::Enabled => "enabled",
        TokenStatus::Disabled => "disabled",
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        status: parse_group_status(&row.get::<_, String>(1)?),
        used_amount: row.get(2)?,
        request_count: row.get(3)?,
        balance: row.get(4)?,
        max_input_tokens: row.get(5)?,
        rpm: row.get(6)?,
        tpm: row.get(7)?,
        balance_alert_threshold: row.get(8)?,
        allowed_models: parse_json_list(row.get(9)?),
    })
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        group_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        status: if row.get::<_, String>(4)? == "disabled" {
            TokenStatus::Disabled
        } else {
            TokenStatus::Enabled
        },
        quota: row.get(5)?,
        used_amount: row.get(6)?,
        request_count: row.get(7)?,
        allowed_models: parse_json_list(row.get(8)?),
        allowed_subnets: parse_json_list(row.get(9)?),
        expires_at: row.get(10)?,
    })
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: ChannelKind::from_str(&row.get::<_, String>(2)?).unwrap_or(ChannelKind::OpenAi),
        status: ChannelStatus::from_str(&row.get::<_, String>(3)?)
            .unwrap_or(ChannelStatus::Disabled),
        base_url: row.get(4)?,
        key: row.get(5)?,
        priority: row.get(6)?,
        weight: row.get::<_, i64>(7)?.max(1) as u32,
        models: parse_json_list(row.get(8)?),
        model_mapping: serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
        plugin: serde_json::from_str(&row.get::<_, String>(10)?)
            .unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_model_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelConfig> {
    Ok(ModelConfig {
        model: row.get(0)?,
        mode: Mode::from_str(&row.get::<_, String>(1)?).unwrap_or(Mode::ChatCompletions),
        price: serde_json::from_str(&row.get::<_, String>(2)?).unwrap_or_default(),
        max_context_tokens: row.get(3)?,
        max_output_tokens: row.get(4)?,
        plugin: serde_json::from_str(&row.get::<_, String>(5)?)
            .unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryData> {
    Ok(SummaryData {
        usage: Usage {
            input_tokens: row.get(0)?,
            image_input_tokens: row.get(1)?,
            audio_input_tokens: row.get(2)?,
            output_tokens: row.get(3)?,
            image_output_tokens: row.get(4)?,
            cached_tokens: row.get(5)?,
            cache_creation_tokens: row.get(6)?,
            reasoning_tokens: row.get(7)?,
            total_tokens: row.get(8)?,
            web_search_count: row.get(9)?,
        },
        counts: crate::model::summary::RequestCounts {
            total: row.get(10)?,
            success: row.get(11)?,
            c4xx: row.get(12)?,
            c5xx: row.get(13)?,
            c429: row.get(14)?,
            c400: row.get(15)?,
            c500: row.get(16)?,
            cache_hit: row.get(17)?,
            web_search: row.get(18)?,
        },
        retry_count: row.get(19)?,
        ttfb_ms_total: row.get(20)?,
        latency_ms_total: row.get(21)?,
        used_amount: row.get(22)?,
    })
}
