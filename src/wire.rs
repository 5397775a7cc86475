use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use tracing::debug;

use crate::auth::{FleetAuthSource, IdentityProvider, SessionIdentity};
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::model::*;
use crate::observability as obs;
use crate::sql::{self, Command, Decision, SqlError, Target};
use crate::tenant::TenantManager;

pub struct FleetHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FleetQueryParser>,
}

impl FleetHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FleetQueryParser),
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

    fn session<C: ClientInfo>(&self, client: &C) -> SessionIdentity {
        SessionIdentity::new(
            client.metadata().get("user").cloned(),
            self.tenant_manager.settings().anonymous_user.clone(),
        )
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let session = self.session(client);
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = obs::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        session: &SessionIdentity,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertVehicle {
                id,
                name,
                schedule,
                utc_offset_secs,
            } => {
                let owner = signed_in(session)?;
                engine
                    .create_vehicle(id, &owner, name, schedule, utc_offset_secs)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteVehicle { id } => {
                let actor = signed_in(session)?;
                engine.delete_vehicle(id, &actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ReplaceSchedule {
                vehicle_id,
                schedule,
            } => {
                let actor = signed_in(session)?;
                engine
                    .update_schedule(vehicle_id, &actor, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpsertOverride {
                vehicle_id,
                day,
                available,
            } => {
                let actor = signed_in(session)?;
                engine
                    .set_override(vehicle_id, &actor, day, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ClearOverride { vehicle_id, day } => {
                let actor = signed_in(session)?;
                let removed = engine
                    .clear_override(vehicle_id, &actor, day)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed)),
                )])
            }
            Command::SubmitBooking {
                vehicle_id,
                start_date,
                end_date,
                pickup_time,
                return_time,
                note,
                channel,
            } => {
                let request = BookingRequest {
                    pickup_time,
                    return_time,
                    note,
                    channel,
                    ..BookingRequest::new(start_date, end_date)
                };
                let submission = engine
                    .submit(session, vehicle_id, request)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(submission_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&submission.booking.id.to_string())?;
                encoder.encode_field(&submission.booking.status.as_str())?;
                encoder.encode_field(&submission.notification.success)?;
                encoder.encode_field(&submission.notification.channel_used)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Decide {
                booking_id,
                decision,
                reason,
            } => {
                let host = signed_in(session)?;
                let decided = match decision {
                    Decision::Confirm => engine.confirm(booking_id, &host).await,
                    Decision::Reject => engine.reject(booking_id, &host, reason).await,
                    Decision::Complete => engine.complete(booking_id, &host).await,
                };
                decided.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CancelBooking { id } => {
                let actor = signed_in(session)?;
                engine.cancel(id, &actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectVehicles => {
                let vehicles = engine.list_vehicles().await;
                let schema = Arc::new(vehicle_schema());
                let rows: Vec<PgWireResult<_>> = vehicles
                    .iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.owner.as_str())?;
                        encoder.encode_field(&v.name)?;
                        encoder.encode_field(&v.schedule.days.to_string())?;
                        encoder.encode_field(&v.schedule.start.format("%H:%M").to_string())?;
                        encoder.encode_field(&v.schedule.end.format("%H:%M").to_string())?;
                        encoder.encode_field(&v.utc_offset_secs)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectOverrides { vehicle_id } => {
                let overrides = engine.overrides(vehicle_id).await.map_err(engine_err)?;
                let schema = Arc::new(override_schema());
                let vid = vehicle_id.to_string();
                let rows: Vec<PgWireResult<_>> = overrides
                    .iter()
                    .map(|o| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&vid)?;
                        encoder.encode_field(&o.date.to_string())?;
                        encoder.encode_field(&o.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBookings { vehicle_id } => {
                let bookings = engine.bookings(vehicle_id).await.map_err(engine_err)?;
                Ok(vec![bookings_response(&bookings)?])
            }
            Command::SelectActiveRentals { vehicle_id } => {
                let mut bookings = engine.active_rentals().await.map_err(engine_err)?;
                if let Some(vid) = vehicle_id {
                    bookings.retain(|b| b.vehicle_id == vid);
                }
                Ok(vec![bookings_response(&bookings)?])
            }
            Command::SelectDayStatus { vehicle_id, day } => {
                let status = engine.status_of(vehicle_id, day).await.map_err(engine_err)?;
                let schema = Arc::new(day_status_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&vehicle_id.to_string())?;
                encoder.encode_field(&day.to_string())?;
                encoder.encode_field(&status.as_str())?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectCalendar {
                vehicle_id,
                year,
                month,
            } => {
                let days = engine
                    .project_month(vehicle_id, year, month)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let rows: Vec<PgWireResult<_>> = days
                    .iter()
                    .map(|(day, status)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day.to_string())?;
                        encoder.encode_field(&status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectCalendarSummary {
                vehicle_id,
                year,
                month,
                months,
            } => {
                let summaries = engine
                    .summarize_months(vehicle_id, year, month, months)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(summary_schema());
                let rows: Vec<PgWireResult<_>> = summaries
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.year)?;
                        encoder.encode_field(&(s.month as i32))?;
                        encoder.encode_field(&(s.available as i32))?;
                        encoder.encode_field(&(s.unavailable as i32))?;
                        encoder.encode_field(&(s.booked as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBookable {
                vehicle_id,
                start_date,
                end_date,
            } => {
                let check = engine
                    .is_bookable(vehicle_id, start_date, end_date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(bookable_schema());
                // One row per blocking day, or a single ok row.
                let days: Vec<Option<String>> = if check.ok {
                    vec![None]
                } else {
                    check
                        .blocking_dates
                        .iter()
                        .map(|d| Some(d.to_string()))
                        .collect()
                };
                let rows: Vec<PgWireResult<_>> = days
                    .iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&check.ok)?;
                        encoder.encode_field(day)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectDisabledDates {
                vehicle_id,
                horizon,
            } => {
                let disabled = engine
                    .disabled_dates(vehicle_id, horizon)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(disabled_schema());
                let before = disabled.before.to_string();
                let days: Vec<Option<String>> = if disabled.dates.is_empty() {
                    vec![None]
                } else {
                    disabled.dates.iter().map(|d| Some(d.to_string())).collect()
                };
                let rows: Vec<PgWireResult<_>> = days
                    .iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&before)?;
                        encoder.encode_field(day)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

fn signed_in(session: &SessionIdentity) -> PgWireResult<Identity> {
    session
        .current_requester()
        .ok_or_else(|| engine_err(EngineError::AuthenticationRequired))
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<pgwire::messages::data::DataRow>>,
) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.vehicle_id.to_string())?;
            encoder.encode_field(&b.requester.as_str())?;
            encoder.encode_field(&b.start_date.to_string())?;
            encoder.encode_field(&b.end_date.to_string())?;
            encoder.encode_field(&b.pickup_time.map(|t| t.format("%H:%M").to_string()))?;
            encoder.encode_field(&b.return_time.map(|t| t.format("%H:%M").to_string()))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.note)?;
            encoder.encode_field(&b.decision_note)?;
            encoder.encode_field(&b.created_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn vehicle_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner"),
        text("name"),
        text("days"),
        text("opens"),
        text("closes"),
        int4("utc_offset"),
    ]
}

fn override_schema() -> Vec<FieldInfo> {
    vec![text("vehicle_id"), text("day"), boolean("available")]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("vehicle_id"),
        text("requester"),
        text("start_date"),
        text("end_date"),
        text("pickup_time"),
        text("return_time"),
        text("status"),
        text("note"),
        text("decision_note"),
        text("created_at"),
    ]
}

fn submission_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("status"), boolean("notified"), text("channel")]
}

fn day_status_schema() -> Vec<FieldInfo> {
    vec![text("vehicle_id"), text("day"), text("status")]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![text("day"), text("status")]
}

fn summary_schema() -> Vec<FieldInfo> {
    vec![
        int4("year"),
        int4("month"),
        int4("available"),
        int4("unavailable"),
        int4("booked"),
    ]
}

fn bookable_schema() -> Vec<FieldInfo> {
    vec![boolean("ok"), text("day")]
}

fn disabled_schema() -> Vec<FieldInfo> {
    vec![text("before"), text("day")]
}

/// Result columns for a statement, known before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::target_table(sql) {
        Some(Target::Select(table)) => match table.as_str() {
            "vehicles" => vehicle_schema(),
            "overrides" => override_schema(),
            "bookings" | "active_rentals" => booking_schema(),
            "day_status" => day_status_schema(),
            "calendar" => calendar_schema(),
            "calendar_summary" => summary_schema(),
            "bookable" => bookable_schema(),
            "disabled_dates" => disabled_schema(),
            _ => vec![],
        },
        Some(Target::Insert(table)) if table == "bookings" => submission_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
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
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        Ok(responses.remove(0))
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FleetAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
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
    let factory = Arc::new(FleetFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::AuthenticationRequired => "28000",
        EngineError::NotPermitted { .. } => "42501",
        EngineError::NotFound(_) => "02000",
        EngineError::DateConflict { .. } | EngineError::StaleConfirmation { .. } => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidRange { .. }
        | EngineError::PastDate { .. }
        | EngineError::InvalidSchedule(_)
        | EngineError::InvalidMonth { .. } => "22023",
        EngineError::WriteTimeout => "57014",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = sqlstate(&e);
    debug!(code, "engine error: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
