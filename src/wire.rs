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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{Engine, EngineError, GenerationReport};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingTarget, Command, ProviderRef, SqlError, StatementKind};
use crate::tenant::TenantManager;

pub struct SlotkeeperHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Execute with query metrics.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

fn resolve_provider(engine: &Engine, provider: &ProviderRef) -> Result<Ulid, EngineError> {
    match provider {
        ProviderRef::Id(id) => engine
            .provider(id)
            .map(|p| p.id)
            .ok_or_else(|| EngineError::UnknownProvider(id.to_string())),
        ProviderRef::Slug(slug) => Ok(engine.resolve_provider(slug)?.id),
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertProvider { id, slug, timezone } => {
            let provider = engine
                .register_provider(id.unwrap_or_else(Ulid::new), &slug, &timezone)
                .await
                .map_err(engine_err)?;
            Ok(rows(provider_schema(), [provider], encode_provider))
        }
        Command::UpsertPatterns { provider_id, session_type, patterns } => {
            let upsert = engine
                .upsert_patterns(provider_id, session_type, patterns)
                .await
                .map_err(engine_err)?;
            Ok(rows(report_schema(), [upsert.report], encode_report))
        }
        Command::DeletePatterns { provider_id, session_type } => {
            let upsert = engine
                .deactivate_patterns(provider_id, session_type)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(upsert.patterns.len())))
        }
        Command::InsertGenerationRun { provider_id, session_type } => {
            let report = engine.regenerate(provider_id, session_type).await.map_err(engine_err)?;
            Ok(rows(report_schema(), [report], encode_report))
        }
        Command::InsertHold { slot_id, holder_token, ttl_ms } => {
            let hold = engine
                .hold_slot(slot_id, &holder_token, ttl_ms)
                .await
                .map_err(engine_err)?;
            Ok(rows(hold_schema(), [hold], encode_hold))
        }
        Command::DeleteHold { slot_id, holder_token } => {
            engine.release_hold(slot_id, &holder_token).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertBooking { id, target, contact } => {
            let booking = match target {
                BookingTarget::Confirm { slot_id, holder_token } => {
                    engine.confirm_booking(slot_id, &holder_token, contact, id).await
                }
                BookingTarget::Direct { slot_id } => engine.book_directly(slot_id, contact, id).await,
                BookingTarget::Manual { provider, session_type } => {
                    let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
                    engine.create_manual_booking(provider_id, session_type, contact, id).await
                }
            }
            .map_err(engine_err)?;
            Ok(rows(booking_schema(), [booking], encode_booking))
        }
        Command::DeleteBooking { id } => {
            engine.cancel_booking(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectProviders { slug } => {
            let providers = match slug {
                Some(slug) => vec![engine.resolve_provider(&slug).map_err(engine_err)?],
                None => engine.list_providers(),
            };
            Ok(rows(provider_schema(), providers, encode_provider))
        }
        Command::SelectPatterns { provider, session_type } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let patterns = engine.list_patterns(provider_id, session_type).await.map_err(engine_err)?;
            Ok(rows(pattern_schema(), patterns, encode_pattern))
        }
        Command::SelectAvailableDates { provider, session_type } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let dates = engine
                .list_available_dates(provider_id, session_type)
                .await
                .map_err(engine_err)?;
            Ok(rows(date_schema(), dates, |encoder, date| encoder.encode_field(&date.to_string())))
        }
        Command::SelectAvailableTimes { provider, session_type, date } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let times = engine
                .list_available_times(provider_id, session_type, date)
                .await
                .map_err(engine_err)?;
            Ok(rows(time_schema(), times, encode_time))
        }
        Command::SelectSlots { provider, session_type, date } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let slots = engine
                .list_slots(provider_id, session_type, date)
                .await
                .map_err(engine_err)?;
            Ok(rows(slot_schema(), slots, encode_slot))
        }
        Command::SelectBookings { provider } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let bookings = engine.list_bookings(provider_id).map_err(engine_err)?;
            Ok(rows(booking_schema(), bookings, encode_booking))
        }
        Command::SelectStaleness { provider, session_type } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let scope = Scope::new(provider_id, session_type);
            let stamps = engine.notify.stamps(scope);
            Ok(rows(staleness_schema(), [(scope, stamps)], |encoder, (scope, stamps)| {
                encoder.encode_field(&scope.provider_id.to_string())?;
                encoder.encode_field(&scope.session_type.to_string())?;
                encoder.encode_field(&stamps.patterns_changed_at)?;
                encoder.encode_field(&stamps.slots_changed_at)?;
                encoder.encode_field(&stamps.latest())
            }))
        }
        Command::SelectGenerationWarnings { provider, session_type } => {
            let provider_id = resolve_provider(engine, &provider).map_err(engine_err)?;
            let report = engine
                .last_generation_report(provider_id, session_type)
                .await
                .map_err(engine_err)?;
            let errors = report.map(|r| r.errors).unwrap_or_default();
            Ok(rows(warning_schema(), errors, |encoder, error| {
                encoder.encode_field(&error.pattern_id.to_string())?;
                encoder.encode_field(&error.kind.to_string())
            }))
        }
        Command::SelectSessionTypes => {
            Ok(rows(session_type_schema(), engine.session_types(), |encoder, (session_type, settings)| {
                encoder.encode_field(&session_type.to_string())?;
                encoder.encode_field(&(settings.duration_ms / 60_000))?;
                encoder.encode_field(&settings.price_cents)
            }))
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_provider(encoder: &mut DataRowEncoder, provider: ProviderInfo) -> PgWireResult<()> {
    encoder.encode_field(&provider.id.to_string())?;
    encoder.encode_field(&provider.slug)?;
    encoder.encode_field(&provider.timezone)
}

fn encode_pattern(encoder: &mut DataRowEncoder, pattern: AvailabilityPattern) -> PgWireResult<()> {
    encoder.encode_field(&pattern.id.to_string())?;
    encoder.encode_field(&pattern.provider_id.to_string())?;
    encoder.encode_field(&pattern.session_type.to_string())?;
    encoder.encode_field(&(pattern.day_of_week as i32))?;
    encoder.encode_field(&format_wall_time(pattern.start_time))?;
    encoder.encode_field(&format_wall_time(pattern.end_time))?;
    encoder.encode_field(&pattern.timezone)?;
    encoder.encode_field(&pattern.is_active)
}

fn encode_time(encoder: &mut DataRowEncoder, view: SlotView) -> PgWireResult<()> {
    encoder.encode_field(&view.slot_id.to_string())?;
    encoder.encode_field(&view.date.to_string())?;
    encoder.encode_field(&format_wall_time(view.start_time))?;
    encoder.encode_field(&format_wall_time(view.end_time))?;
    encoder.encode_field(&view.timezone)?;
    encoder.encode_field(&view.starts_at)?;
    encoder.encode_field(&view.ends_at)
}

fn encode_slot(encoder: &mut DataRowEncoder, info: SlotInfo) -> PgWireResult<()> {
    let slot = info.slot;
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.date.to_string())?;
    encoder.encode_field(&format_wall_time(slot.start_time))?;
    encoder.encode_field(&format_wall_time(slot.end_time))?;
    encoder.encode_field(&slot.timezone)?;
    encoder.encode_field(&info.state.as_str().to_string())?;
    encoder.encode_field(&slot.span.start)?;
    encoder.encode_field(&slot.span.end)?;
    encoder.encode_field(&slot.booking_id().map(|id| id.to_string()))
}

fn encode_booking(encoder: &mut DataRowEncoder, booking: Booking) -> PgWireResult<()> {
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.slot_id.map(|id| id.to_string()))?;
    encoder.encode_field(&booking.scope.provider_id.to_string())?;
    encoder.encode_field(&booking.scope.session_type.to_string())?;
    encoder.encode_field(&booking.contact.name)?;
    encoder.encode_field(&booking.contact.email)?;
    encoder.encode_field(&booking.contact.phone)?;
    encoder.encode_field(&booking.contact.notes)?;
    encoder.encode_field(&booking.created_at)
}

fn encode_hold(encoder: &mut DataRowEncoder, hold: Hold) -> PgWireResult<()> {
    encoder.encode_field(&hold.slot_id.to_string())?;
    encoder.encode_field(&hold.holder_token)?;
    encoder.encode_field(&hold.expires_at)
}

fn encode_report(encoder: &mut DataRowEncoder, report: GenerationReport) -> PgWireResult<()> {
    encoder.encode_field(&(report.created as i64))?;
    encoder.encode_field(&(report.refreshed as i64))?;
    encoder.encode_field(&(report.skipped as i64))?;
    encoder.encode_field(&(report.expired as i64))?;
    encoder.encode_field(&(report.skipped_nonexistent as i64))?;
    encoder.encode_field(&(report.errors.len() as i64))?;
    encoder.encode_field(&report.at)
}

// ── Schemas ──────────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn provider_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("slug"), text("timezone")]
}

fn pattern_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("provider_id"),
        text("session_type"),
        FieldInfo::new("day_of_week".into(), None, None, Type::INT4, FieldFormat::Text),
        text("start_time"),
        text("end_time"),
        text("timezone"),
        FieldInfo::new("is_active".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn date_schema() -> Vec<FieldInfo> {
    vec![text("date")]
}

fn time_schema() -> Vec<FieldInfo> {
    vec![
        text("slot_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("timezone"),
        int8("starts_at"),
        int8("ends_at"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("slot_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("timezone"),
        text("state"),
        int8("starts_at"),
        int8("ends_at"),
        text("booking_id"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("slot_id"),
        text("provider_id"),
        text("session_type"),
        text("client_name"),
        text("client_email"),
        text("client_phone"),
        text("client_notes"),
        int8("created_at"),
    ]
}

fn hold_schema() -> Vec<FieldInfo> {
    vec![text("slot_id"), text("holder_token"), int8("expires_at")]
}

fn report_schema() -> Vec<FieldInfo> {
    vec![
        int8("created"),
        int8("refreshed"),
        int8("skipped"),
        int8("expired"),
        int8("skipped_nonexistent"),
        int8("errors"),
        int8("generated_at"),
    ]
}

fn staleness_schema() -> Vec<FieldInfo> {
    vec![
        text("provider_id"),
        text("session_type"),
        int8("patterns_changed_at"),
        int8("slots_changed_at"),
        int8("last_event_at"),
    ]
}

fn warning_schema() -> Vec<FieldInfo> {
    vec![text("pattern_id"), text("message")]
}

fn session_type_schema() -> Vec<FieldInfo> {
    vec![text("session_type"), int8("duration_minutes"), int8("price_cents")]
}

fn result_schema(kind: StatementKind, table: &str) -> Vec<FieldInfo> {
    use StatementKind::*;
    match (kind, table) {
        (Select | Insert, "providers") => provider_schema(),
        (Select, "patterns") => pattern_schema(),
        (Insert, "patterns" | "generation_runs") => report_schema(),
        (Select, "available_dates") => date_schema(),
        (Select, "available_times") => time_schema(),
        (Select, "slots") => slot_schema(),
        (Select | Insert, "bookings") => booking_schema(),
        (Insert, "holds") => hold_schema(),
        (Select, "staleness") => staleness_schema(),
        (Select, "generation_warnings") => warning_schema(),
        (Select, "session_types") => session_type_schema(),
        _ => Vec::new(),
    }
}

fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::statement_target(sql)
        .map(|(kind, table)| result_schema(kind, &table))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
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
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, describe(&target.statement)))
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
        Ok(DescribePortalResponse::new(describe(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Substitute `$1, $2, ...` with bound parameter values (text format).
/// Higher indexes go first so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotkeeperFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error. Races are retryable serialization
/// failures.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        _ if e.is_race() => "40001",
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::NotFound(_) | EngineError::UnknownProvider(_) => "P0002",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Invalid(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
