use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use mcpay::address::normalize_address;
use mcpay::security::sha256_hex;
use mcpay::WalletChain;

use crate::error::ProxyError;
use crate::store::{
    IdentityStore, PaymentRecord, PaymentStatus, PaymentStore, PricingEntry, ServerCatalog,
    ServerRecord, ToolRecord, UsageRecord, UsageRecorder, UserRecord,
};

/// Per-tool analytics stats record
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolStats {
    pub tool_id: String,
    pub request_count: i64,
    pub payment_count: i64,
    /// Total revenue in the token's smallest unit (integer string, e.g. "142000")
    pub revenue_total: String,
    pub token_decimals: u32,
    pub last_accessed_at: Option<i64>,
}

/// SQLite database wrapper
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, ProxyError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), ProxyError> {
        self.with_connection(|conn| {
            // WAL for concurrent readers alongside the single writer
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS servers (
                    id TEXT PRIMARY KEY,
                    origin_url TEXT NOT NULL,
                    receiver_address TEXT NOT NULL,
                    name TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tools (
                    id TEXT PRIMARY KEY,
                    server_id TEXT NOT NULL REFERENCES servers(id),
                    name TEXT NOT NULL,
                    description TEXT,
                    created_at INTEGER NOT NULL,
                    UNIQUE(server_id, name)
                );

                CREATE TABLE IF NOT EXISTS tool_pricing (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tool_id TEXT NOT NULL REFERENCES tools(id),
                    network TEXT NOT NULL,
                    asset_address TEXT NOT NULL,
                    max_amount_required_raw TEXT NOT NULL,
                    token_decimals INTEGER NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_tool_pricing_tool ON tool_pricing(tool_id);

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_wallets (
                    address TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    chain TEXT NOT NULL,
                    is_primary INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_user_wallets_user ON user_wallets(user_id);

                CREATE TABLE IF NOT EXISTS api_keys (
                    key_hash TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at INTEGER NOT NULL,
                    last_used_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS payments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    signature TEXT UNIQUE NOT NULL,
                    server_id TEXT NOT NULL,
                    tool_id TEXT NOT NULL,
                    user_id TEXT,
                    amount_raw TEXT NOT NULL,
                    token_decimals INTEGER NOT NULL,
                    asset TEXT NOT NULL,
                    network TEXT NOT NULL,
                    payer TEXT,
                    status TEXT NOT NULL,
                    transaction_hash TEXT,
                    created_at INTEGER NOT NULL,
                    settled_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS usage_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tool_id TEXT NOT NULL,
                    server_id TEXT NOT NULL,
                    user_id TEXT,
                    status INTEGER NOT NULL,
                    latency_ms INTEGER NOT NULL,
                    ip_address TEXT,
                    user_agent TEXT,
                    arguments TEXT,
                    result TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_usage_tool ON usage_records(tool_id);

                CREATE TABLE IF NOT EXISTS tool_stats (
                    tool_id TEXT PRIMARY KEY,
                    request_count INTEGER NOT NULL DEFAULT 0,
                    payment_count INTEGER NOT NULL DEFAULT 0,
                    revenue_total TEXT NOT NULL DEFAULT '0',
                    token_decimals INTEGER NOT NULL DEFAULT 6,
                    last_accessed_at INTEGER
                );
                "#,
            )?;
            Ok(())
        })
    }

    /// Scoped synchronous access to the connection.
    pub fn with_connection<F, T>(&self, f: F) -> Result<T, ProxyError>
    where
        F: FnOnce(&Connection) -> Result<T, ProxyError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ProxyError::Internal("database lock poisoned".to_string()))?;
        f(&conn)
    }

    /// Run a query on the blocking pool so request tasks never stall a runtime thread.
    async fn call<F, T>(&self, f: F) -> Result<T, ProxyError>
    where
        F: FnOnce(&Connection) -> Result<T, ProxyError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_connection(f))
            .await
            .map_err(|e| ProxyError::Internal(format!("database task failed: {e}")))?
    }

    /// Register an upstream server (replaces an existing one with the same id).
    pub fn insert_server(&self, server: &ServerRecord) -> Result<(), ProxyError> {
        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO servers (id, origin_url, receiver_address, name, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    origin_url = excluded.origin_url,
                    receiver_address = excluded.receiver_address,
                    name = excluded.name
                "#,
                params![
                    server.id,
                    server.origin_url,
                    server.receiver_address,
                    server.name,
                    chrono::Utc::now().timestamp()
                ],
            )?;
            Ok(())
        })
    }

    /// Register a tool together with its pricing entries, in catalog order.
    pub fn insert_tool(&self, tool: &ToolRecord) -> Result<(), ProxyError> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = chrono::Utc::now().timestamp();
            tx.execute(
                r#"
                INSERT INTO tools (id, server_id, name, description, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![tool.id, tool.server_id, tool.name, tool.description, now],
            )?;
            for entry in &tool.pricing {
                insert_pricing_row(&tx, &tool.id, entry)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Append a pricing entry to an existing tool. Appended entries sort last.
    pub fn insert_pricing(&self, tool_id: &str, entry: &PricingEntry) -> Result<(), ProxyError> {
        self.with_connection(|conn| insert_pricing_row(conn, tool_id, entry))
    }

    /// Create a user, optionally with a primary wallet.
    pub fn create_user(&self, wallet: Option<(&str, WalletChain)>) -> Result<UserRecord, ProxyError> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            let user = insert_user(&tx, wallet)?;
            tx.commit()?;
            Ok(user)
        })
    }

    /// Store an API key for a user. Only the SHA-256 digest is persisted.
    pub fn insert_api_key(&self, user_id: &str, raw_key: &str) -> Result<(), ProxyError> {
        let key_hash = sha256_hex(raw_key.as_bytes());
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO api_keys (key_hash, user_id, active, created_at) VALUES (?1, ?2, 1, ?3)",
                params![key_hash, user_id, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    /// Usage records for a tool, newest first.
    pub fn list_usage(&self, tool_id: &str) -> Result<Vec<UsageRecord>, ProxyError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT tool_id, server_id, user_id, status, latency_ms, ip_address, user_agent, arguments, result
                FROM usage_records
                WHERE tool_id = ?1
                ORDER BY id DESC
                "#,
            )?;
            let rows = stmt
                .query_map(params![tool_id], |row| {
                    let arguments: Option<String> = row.get(7)?;
                    let result: Option<String> = row.get(8)?;
                    Ok(UsageRecord {
                        tool_id: row.get(0)?,
                        server_id: row.get(1)?,
                        user_id: row.get(2)?,
                        status: row.get::<_, i64>(3)? as u16,
                        latency_ms: row.get::<_, i64>(4)? as u64,
                        ip_address: row.get(5)?,
                        user_agent: row.get(6)?,
                        arguments: arguments.and_then(|s| serde_json::from_str(&s).ok()),
                        result: result.and_then(|s| serde_json::from_str(&s).ok()),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of payment rows for a signature (0 or 1 by construction).
    pub fn count_payments(&self, signature: &str) -> Result<i64, ProxyError> {
        self.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM payments WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )?)
        })
    }

    /// Get analytics stats for a single tool.
    pub fn get_tool_stats(&self, tool_id: &str) -> Result<Option<ToolStats>, ProxyError> {
        self.with_connection(|conn| {
            let stats = conn
                .query_row(
                    r#"
                    SELECT tool_id, request_count, payment_count, revenue_total, token_decimals, last_accessed_at
                    FROM tool_stats
                    WHERE tool_id = ?1
                    "#,
                    params![tool_id],
                    map_tool_stats,
                )
                .optional()?;
            Ok(stats)
        })
    }

    /// List tool stats ordered by revenue descending with pagination.
    pub fn list_tool_stats(&self, limit: u32, offset: u32) -> Result<Vec<ToolStats>, ProxyError> {
        let limit = limit.clamp(1, 500);
        self.with_connection(|conn| {
            // revenue_total is a u128 string: order by length first, then lexically
            let mut stmt = conn.prepare(
                r#"
                SELECT tool_id, request_count, payment_count, revenue_total, token_decimals, last_accessed_at
                FROM tool_stats
                ORDER BY length(revenue_total) DESC, revenue_total DESC
                LIMIT ?1 OFFSET ?2
                "#,
            )?;
            let stats = stmt
                .query_map(params![limit, offset], map_tool_stats)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(stats)
        })
    }
}

fn map_tool_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolStats> {
    Ok(ToolStats {
        tool_id: row.get(0)?,
        request_count: row.get(1)?,
        payment_count: row.get(2)?,
        revenue_total: row.get(3)?,
        token_decimals: row.get(4)?,
        last_accessed_at: row.get(5)?,
    })
}

fn insert_pricing_row(
    conn: &Connection,
    tool_id: &str,
    entry: &PricingEntry,
) -> Result<(), ProxyError> {
    conn.execute(
        r#"
        INSERT INTO tool_pricing
            (tool_id, network, asset_address, max_amount_required_raw, token_decimals, active)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            tool_id,
            entry.network,
            entry.asset_address,
            entry.max_amount_required_raw,
            entry.token_decimals,
            entry.active as i32
        ],
    )?;
    Ok(())
}

fn insert_user(
    conn: &Connection,
    wallet: Option<(&str, WalletChain)>,
) -> Result<UserRecord, ProxyError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO users (id, created_at) VALUES (?1, ?2)",
        params![id, now],
    )?;
    let wallet_address = match wallet {
        Some((address, chain)) => {
            let address = normalize_address(address);
            conn.execute(
                r#"
                INSERT INTO user_wallets (address, user_id, chain, is_primary, created_at)
                VALUES (?1, ?2, ?3, 1, ?4)
                "#,
                params![address, id, chain.as_str(), now],
            )?;
            Some(address)
        }
        None => None,
    };
    Ok(UserRecord { id, wallet_address })
}

fn map_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let status: String = row.get(9)?;
    Ok(PaymentRecord {
        signature: row.get(0)?,
        server_id: row.get(1)?,
        tool_id: row.get(2)?,
        user_id: row.get(3)?,
        amount_raw: row.get(4)?,
        token_decimals: row.get(5)?,
        asset: row.get(6)?,
        network: row.get(7)?,
        payer: row.get(8)?,
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Pending),
        transaction_hash: row.get(10)?,
    })
}

fn select_payment(conn: &Connection, signature: &str) -> Result<Option<PaymentRecord>, ProxyError> {
    Ok(conn
        .query_row(
            r#"
            SELECT signature, server_id, tool_id, user_id, amount_raw, token_decimals, asset, network, payer, status, transaction_hash
            FROM payments
            WHERE signature = ?1
            "#,
            params![signature],
            map_payment,
        )
        .optional()?)
}

/// Add a settled payment to the tool's revenue. u128 arithmetic: totals can exceed i64.
fn record_revenue(conn: &Connection, record: &PaymentRecord, now: i64) -> Result<(), ProxyError> {
    let add_amount: u128 = record.amount_raw.parse().unwrap_or(0);
    let current_revenue: String = conn
        .query_row(
            "SELECT revenue_total FROM tool_stats WHERE tool_id = ?1",
            params![record.tool_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| "0".to_string());
    let current: u128 = current_revenue.parse().unwrap_or(0);
    let new_revenue = current.saturating_add(add_amount).to_string();

    conn.execute(
        r#"
        INSERT INTO tool_stats (tool_id, request_count, payment_count, revenue_total, token_decimals, last_accessed_at)
        VALUES (?1, 0, 1, ?2, ?3, ?4)
        ON CONFLICT(tool_id) DO UPDATE SET
            payment_count = payment_count + 1,
            revenue_total = ?2,
            token_decimals = ?3,
            last_accessed_at = ?4
        "#,
        params![record.tool_id, new_revenue, record.token_decimals, now],
    )?;
    Ok(())
}

#[async_trait]
impl ServerCatalog for Database {
    async fn lookup_server_by_id(&self, id: &str) -> Result<Option<ServerRecord>, ProxyError> {
        let id = id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, origin_url, receiver_address, name FROM servers WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(ServerRecord {
                            id: row.get(0)?,
                            origin_url: row.get(1)?,
                            receiver_address: row.get(2)?,
                            name: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolRecord>, ProxyError> {
        let server_id = server_id.to_string();
        self.call(move |conn| {
            let mut tools_stmt = conn.prepare(
                "SELECT id, server_id, name, description FROM tools WHERE server_id = ?1 ORDER BY created_at, id",
            )?;
            let mut tools = tools_stmt
                .query_map(params![server_id], |row| {
                    Ok(ToolRecord {
                        id: row.get(0)?,
                        server_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        pricing: Vec::new(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut pricing_stmt = conn.prepare(
                r#"
                SELECT network, asset_address, max_amount_required_raw, token_decimals, active
                FROM tool_pricing
                WHERE tool_id = ?1
                ORDER BY id
                "#,
            )?;
            for tool in &mut tools {
                tool.pricing = pricing_stmt
                    .query_map(params![tool.id], |row| {
                        Ok(PricingEntry {
                            network: row.get(0)?,
                            asset_address: row.get(1)?,
                            max_amount_required_raw: row.get(2)?,
                            token_decimals: row.get(3)?,
                            active: row.get::<_, i32>(4)? == 1,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
            }
            Ok(tools)
        })
        .await
    }
}

#[async_trait]
impl IdentityStore for Database {
    async fn validate_api_key(&self, key_hash: &str) -> Result<Option<UserRecord>, ProxyError> {
        let key_hash = key_hash.to_string();
        self.call(move |conn| {
            let user_id: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM api_keys WHERE key_hash = ?1 AND active = 1",
                    params![key_hash],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(user_id) = user_id else {
                return Ok(None);
            };
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE key_hash = ?2",
                params![chrono::Utc::now().timestamp(), key_hash],
            )?;
            Ok(Some(UserRecord {
                id: user_id,
                wallet_address: None,
            }))
        })
        .await
    }

    async fn primary_wallet(&self, user_id: &str) -> Result<Option<String>, ProxyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    r#"
                    SELECT address FROM user_wallets
                    WHERE user_id = ?1
                    ORDER BY is_primary DESC, created_at ASC
                    LIMIT 1
                    "#,
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn get_or_create_user_by_wallet(
        &self,
        address: &str,
        chain: WalletChain,
    ) -> Result<UserRecord, ProxyError> {
        let address = normalize_address(address);
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM user_wallets WHERE address = ?1",
                    params![address],
                    |row| row.get(0),
                )
                .optional()?;
            let user = match existing {
                Some(id) => UserRecord {
                    id,
                    wallet_address: Some(address),
                },
                None => insert_user(&tx, Some((&address, chain)))?,
            };
            tx.commit()?;
            Ok(user)
        })
        .await
    }
}

#[async_trait]
impl PaymentStore for Database {
    async fn get_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<PaymentRecord>, ProxyError> {
        let signature = signature.to_string();
        self.call(move |conn| select_payment(conn, &signature)).await
    }

    async fn create(&self, record: &PaymentRecord) -> Result<bool, ProxyError> {
        let record = record.clone();
        self.call(move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO payments
                    (signature, server_id, tool_id, user_id, amount_raw, token_decimals, asset, network, payer, status, transaction_hash, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    record.signature,
                    record.server_id,
                    record.tool_id,
                    record.user_id,
                    record.amount_raw,
                    record.token_decimals,
                    record.asset,
                    record.network,
                    record.payer,
                    record.status.as_str(),
                    record.transaction_hash,
                    chrono::Utc::now().timestamp()
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn update_status(&self, record: &PaymentRecord) -> Result<(), ProxyError> {
        let record = record.clone();
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let now = chrono::Utc::now().timestamp();
            let previous = select_payment(&tx, &record.signature)?.map(|p| p.status);
            let settled_at = (record.status == PaymentStatus::Completed).then_some(now);

            tx.execute(
                r#"
                INSERT INTO payments
                    (signature, server_id, tool_id, user_id, amount_raw, token_decimals, asset, network, payer, status, transaction_hash, created_at, settled_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(signature) DO UPDATE SET
                    status = excluded.status,
                    transaction_hash = COALESCE(excluded.transaction_hash, payments.transaction_hash),
                    payer = COALESCE(payments.payer, excluded.payer),
                    settled_at = COALESCE(excluded.settled_at, payments.settled_at)
                "#,
                params![
                    record.signature,
                    record.server_id,
                    record.tool_id,
                    record.user_id,
                    record.amount_raw,
                    record.token_decimals,
                    record.asset,
                    record.network,
                    record.payer,
                    record.status.as_str(),
                    record.transaction_hash,
                    now,
                    settled_at
                ],
            )?;

            if record.status == PaymentStatus::Completed
                && previous != Some(PaymentStatus::Completed)
            {
                record_revenue(&tx, &record, now)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UsageRecorder for Database {
    async fn record(&self, usage: &UsageRecord) -> Result<(), ProxyError> {
        let usage = usage.clone();
        self.call(move |conn| {
            let now = chrono::Utc::now().timestamp();
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                r#"
                INSERT INTO usage_records
                    (tool_id, server_id, user_id, status, latency_ms, ip_address, user_agent, arguments, result, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    usage.tool_id,
                    usage.server_id,
                    usage.user_id,
                    usage.status as i64,
                    usage.latency_ms as i64,
                    usage.ip_address,
                    usage.user_agent,
                    usage.arguments.as_ref().map(|v| v.to_string()),
                    usage.result.as_ref().map(|v| v.to_string()),
                    now
                ],
            )?;
            tx.execute(
                r#"
                INSERT INTO tool_stats (tool_id, request_count, payment_count, revenue_total, last_accessed_at)
                VALUES (?1, 1, 0, '0', ?2)
                ON CONFLICT(tool_id) DO UPDATE SET
                    request_count = request_count + 1,
                    last_accessed_at = ?2
                "#,
                params![usage.tool_id, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
