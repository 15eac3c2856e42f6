use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotgateAuthSource;
use crate::engine::Engine;
use crate::observability;
use crate::sql::{self, Command};
use crate::store::ClaimOutcome;
use crate::tenant::TenantManager;

pub struct SlotgateHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotgateQueryParser>,
}

impl SlotgateHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotgateQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute, and record metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::RenewLease {
                resource_id,
                token,
                now,
                expires_at,
            } => {
                let lease = engine
                    .renew_lease(&resource_id, &token, now, expires_at)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(lease_schema());
                let rows = lease
                    .into_iter()
                    .map(|lease| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&i64::from(lease.slot))?;
                        encoder.encode_field(&lease.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect::<Vec<PgWireResult<_>>>();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::ClaimSlot(claim) => {
                let outcome = engine.claim_slot(&claim).await.map_err(engine_err)?;
                let row = match outcome {
                    ClaimOutcome::Claimed(lease) => Some(("claimed", lease)),
                    ClaimOutcome::AlreadyHeld(lease) => Some(("held", lease)),
                    ClaimOutcome::Taken => None,
                };
                let schema = Arc::new(claim_schema());
                let rows = row
                    .into_iter()
                    .map(|(outcome, lease)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&outcome.to_string())?;
                        encoder.encode_field(&i64::from(lease.slot))?;
                        encoder.encode_field(&lease.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect::<Vec<PgWireResult<_>>>();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SlotUsage {
                resource_id,
                token,
                now,
            } => {
                let usage = engine.usage(&resource_id, token.as_ref(), now).await;
                let schema = Arc::new(usage_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&i64::from(usage.active))?;
                encoder.encode_field(&usage.owned.map(|l| i64::from(l.slot)))?;
                encoder.encode_field(&usage.owned.map(|l| l.expires_at))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots { resource_id } => {
                let slots = engine.list_slots(&resource_id).await;
                let schema = Arc::new(slots_schema());
                let rows = slots
                    .into_iter()
                    .map(|row| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&i64::from(row.slot))?;
                        encoder.encode_field(&row.token.to_string())?;
                        encoder.encode_field(&row.user_id.as_ref().map(|u| u.as_str().to_string()))?;
                        encoder.encode_field(&row.expires_at)?;
                        encoder.encode_field(&row.created_at)?;
                        encoder.encode_field(&row.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect::<Vec<PgWireResult<_>>>();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::DeleteExpired { now } => {
                let removed = engine.sweep_expired(now).await.map_err(engine_err)?;
                metrics::counter!(observability::SLOTS_REAPED_TOTAL).increment(removed as u64);
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed)))
            }
        }
    }
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn lease_schema() -> Vec<FieldInfo> {
    vec![int8("slot"), int8("expires_at")]
}

fn claim_schema() -> Vec<FieldInfo> {
    vec![varchar("outcome"), int8("slot"), int8("expires_at")]
}

fn usage_schema() -> Vec<FieldInfo> {
    vec![int8("active"), int8("slot"), int8("expires_at")]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        int8("slot"),
        varchar("token"),
        varchar("user_id"),
        int8("expires_at"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

/// Result columns for a statement that has not been executed yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if lower.trim_start().starts_with("delete") {
        vec![]
    } else if lower.contains("renew_lease") {
        lease_schema()
    } else if lower.contains("claim_slot") {
        claim_schema()
    } else if lower.contains("slot_usage") {
        usage_schema()
    } else if lower.contains("slots") {
        slots_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotgateHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotgateQueryParser;

#[async_trait]
impl QueryParser for SlotgateQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotgateHandler {
    type Statement = String;
    type QueryParser = SlotgateQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text-format parameters as quoted literals. Highest index first so `$1`
/// never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotgateFactory {
    handler: Arc<SlotgateHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotgateAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotgateFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotgateAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotgateHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotgateFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one store-server connection until the client disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotgateFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
