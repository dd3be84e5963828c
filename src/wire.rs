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
use ulid::Ulid;

use crate::auth::PortalAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::site::SiteManager;
use crate::sql::{self, BookingFilter, Command, ResultTable, SqlError};

pub struct PortalHandler {
    sites: Arc<SiteManager>,
    operator_login: String,
    query_parser: Arc<PortalQueryParser>,
}

impl PortalHandler {
    pub fn new(sites: Arc<SiteManager>, operator_login: String) -> Self {
        Self {
            sites,
            operator_login,
            query_parser: Arc::new(PortalQueryParser),
        }
    }

    /// Site engine from the database name, principal from the login name.
    /// Resolved per statement so role changes apply to open sessions.
    fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Principal)> {
        let metadata = client.metadata();
        let site = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let engine = self.sites.get_or_open(&site).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("site error: {e}"),
            )))
        })?;
        let login = metadata.get("user").map(String::as_str).unwrap_or_default();
        let principal = engine
            .principal_for_login(login, &self.operator_login)
            .inspect_err(|_| {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("login {login:?} is not a registered user of site {site}");
            })
            .map_err(engine_err)?;
        Ok((engine, principal))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = match self.resolve_session(client) {
            Ok((engine, principal)) => self.execute_command(&engine, &principal, cmd).await,
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        principal: &Principal,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            // ── Users ────────────────────────────────────────
            Command::InsertUser {
                id,
                name,
                is_admin,
                returning,
            } => {
                let id = id.unwrap_or_else(Ulid::new);
                engine
                    .register_user(principal, id, name.unwrap_or_default(), is_admin)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let user = engine.get_user(principal, id).map_err(engine_err)?;
                    Ok(users_response(vec![user]))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateUser {
                id,
                name,
                is_admin,
                returning,
            } => {
                let user = engine
                    .update_user(principal, id, name, is_admin)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(users_response(vec![user]))
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => vec![engine.get_user(principal, id).map_err(engine_err)?],
                    None if principal.is_admin => engine.list_users(principal).map_err(engine_err)?,
                    None => vec![engine.get_user(principal, principal.user_id).map_err(engine_err)?],
                };
                Ok(users_response(users))
            }

            // ── Certifications ───────────────────────────────
            Command::InsertCertification { user_id, machine_id } => {
                let granted = engine
                    .grant_certification(principal, user_id, machine_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(granted as usize)))
            }
            Command::DeleteCertification { user_id, machine_id } => {
                let revoked = engine
                    .revoke_certification(principal, user_id, machine_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(revoked as usize)))
            }
            Command::SelectCertifications { user_id } => {
                let user_id = user_id.unwrap_or(principal.user_id);
                let machines = engine
                    .list_certifications(principal, user_id)
                    .map_err(engine_err)?;
                Ok(certifications_response(user_id, machines))
            }

            // ── Machines ─────────────────────────────────────
            Command::InsertMachine {
                id,
                name,
                kind,
                requires_certification,
                returning,
            } => {
                let id = id.unwrap_or_else(Ulid::new);
                engine
                    .create_machine(
                        principal,
                        id,
                        name.unwrap_or_default(),
                        kind,
                        requires_certification,
                    )
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let machine = engine.get_machine(id).await.map_err(engine_err)?;
                    Ok(machines_response(vec![machine]))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateMachine { id, patch, returning } => {
                let machine = engine
                    .update_machine(principal, id, patch)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(machines_response(vec![machine]))
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::DeleteMachine { id } => {
                engine.delete_machine(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectMachines { id } => {
                let machines = match id {
                    Some(id) => vec![engine.get_machine(id).await.map_err(engine_err)?],
                    None => engine.list_machines().await,
                };
                Ok(machines_response(machines))
            }

            // ── Bookings ─────────────────────────────────────
            Command::InsertBooking { request, returning } => {
                let booking = engine
                    .create_booking(principal, request)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(bookings_response(vec![cached_row(booking)]))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateBookingStatus { id, status, returning } => {
                let booking = engine
                    .set_booking_status(principal, id, &status)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(bookings_response(vec![cached_row(booking)]))
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let rows = match filter {
                    BookingFilter::Visible if principal.is_admin => engine
                        .list_all_bookings(principal)
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .map(|v| BookingRow {
                            booking: v.booking,
                            user_name: Some(v.user_name),
                            machine_name: Some(v.machine_name),
                        })
                        .collect(),
                    BookingFilter::Visible => engine
                        .list_bookings_for_user(principal, principal.user_id)
                        .map_err(engine_err)?
                        .into_iter()
                        .map(cached_row)
                        .collect(),
                    BookingFilter::Id(id) => {
                        vec![cached_row(engine.get_booking(principal, id).map_err(engine_err)?)]
                    }
                    BookingFilter::User(user_id) => engine
                        .list_bookings_for_user(principal, user_id)
                        .map_err(engine_err)?
                        .into_iter()
                        .map(cached_row)
                        .collect(),
                    BookingFilter::Machine(machine_id) => engine
                        .list_bookings_for_machine(principal, machine_id)
                        .map_err(engine_err)?
                        .into_iter()
                        .map(cached_row)
                        .collect(),
                };
                Ok(bookings_response(rows))
            }
            Command::SelectSlots { machine_id, date } => {
                let claims = engine
                    .claimed_slots(machine_id, &date)
                    .await
                    .map_err(engine_err)?;
                Ok(slots_response(claims))
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

struct BookingRow {
    booking: Booking,
    user_name: Option<String>,
    machine_name: Option<String>,
}

fn cached_row(booking: Booking) -> BookingRow {
    BookingRow {
        user_name: booking.user_name.clone(),
        machine_name: booking.machine_name.clone(),
        booking,
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("machine_id"),
        text_field("date"),
        text_field("time"),
        text_field("status"),
        text_field("user_name"),
        text_field("machine_name"),
        typed_field("created_at", Type::INT8),
        typed_field("updated_at", Type::INT8),
    ]
}

fn machine_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("type"),
        text_field("status"),
        typed_field("requires_certification", Type::BOOL),
        text_field("maintenance_note"),
        // JSON array of slot keys
        text_field("held_slots"),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        typed_field("is_admin", Type::BOOL),
        text_field("certifications"),
        typed_field("booking_count", Type::INT8),
    ]
}

fn certification_schema() -> Vec<FieldInfo> {
    vec![text_field("user_id"), text_field("machine_id")]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text_field("slot"), text_field("time"), text_field("status")]
}

fn schema_for(table: ResultTable) -> Vec<FieldInfo> {
    match table {
        ResultTable::Users => user_schema(),
        ResultTable::Certifications => certification_schema(),
        ResultTable::Machines => machine_schema(),
        ResultTable::Bookings => booking_schema(),
        ResultTable::Slots => slot_schema(),
    }
}

fn described_schema(sql: &str) -> Vec<FieldInfo> {
    sql::result_table(sql).map(schema_for).unwrap_or_default()
}

fn json_list<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    serde_json::Value::from(items.into_iter().map(|i| i.to_string()).collect::<Vec<_>>()).to_string()
}

fn bookings_response(rows: Vec<BookingRow>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let b = &row.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.machine_id.to_string())?;
            encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&b.time)?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&row.user_name)?;
            encoder.encode_field(&row.machine_name)?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn machines_response(machines: Vec<Machine>) -> Response {
    let schema = Arc::new(machine_schema());
    let rows: Vec<PgWireResult<_>> = machines
        .into_iter()
        .map(|m| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&m.id.to_string())?;
            encoder.encode_field(&m.name)?;
            encoder.encode_field(&m.kind)?;
            encoder.encode_field(&m.status.as_str().to_string())?;
            encoder.encode_field(&m.requires_certification)?;
            encoder.encode_field(&m.maintenance_note)?;
            encoder.encode_field(&json_list(&m.held_slots))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn users_response(users: Vec<UserInfo>) -> Response {
    let schema = Arc::new(user_schema());
    let rows: Vec<PgWireResult<_>> = users
        .into_iter()
        .map(|u| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&u.id.to_string())?;
            encoder.encode_field(&u.name)?;
            encoder.encode_field(&u.is_admin)?;
            encoder.encode_field(&json_list(&u.certifications))?;
            encoder.encode_field(&(u.booking_count as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn certifications_response(user_id: Ulid, machines: Vec<Ulid>) -> Response {
    let schema = Arc::new(certification_schema());
    let uid = user_id.to_string();
    let rows: Vec<PgWireResult<_>> = machines
        .into_iter()
        .map(|machine_id| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&uid)?;
            encoder.encode_field(&machine_id.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slots_response(claims: Vec<SlotClaim>) -> Response {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = claims
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.slot.to_string())?;
            encoder.encode_field(&c.time)?;
            encoder.encode_field(&c.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for PortalHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PortalQueryParser;

#[async_trait]
impl QueryParser for PortalQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
        Ok(described_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for PortalHandler {
    type Statement = String;
    type QueryParser = PortalQueryParser;

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
        self.run(client, &sql).await
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
            described_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(described_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Inline bound parameters (text format) as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, portal.parameters.as_slice())
}

/// One left-to-right pass over `$n` placeholders. Bound values are never
/// rescanned, and placeholders inside quoted literals are left alone.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let bound = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match bound {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PortalFactory {
    handler: Arc<PortalHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PortalAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl PortalFactory {
    pub fn new(sites: Arc<SiteManager>, password: String, operator_login: String) -> Self {
        Self {
            handler: Arc::new(PortalHandler::new(sites, operator_login)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PortalAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PortalFactory {
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
    sites: Arc<SiteManager>,
    password: String,
    operator_login: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = PortalFactory::new(sites, password, operator_login);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(..) => "23505",
        EngineError::Unauthorized => "28000",
        EngineError::Forbidden(_) => "42501",
        EngineError::ResourceUnavailable(_) => "55000",
        EngineError::CertificationRequired => "P0003",
        EngineError::SlotConflict { .. } => "23P01",
        EngineError::InvalidStatus(_) | EngineError::InvalidTransition { .. } => "22P02",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22P02",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE machine_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("UPDATE bookings SET status = $2 WHERE id = $10"), 10);
    }

    #[test]
    fn bound_values_are_inlined_once() {
        let params = [Some("$1 or '1'='1"), Some("ok")];
        assert_eq!(
            inline_params("UPDATE bookings SET status = $2 WHERE id = $1", &params[..]),
            "UPDATE bookings SET status = 'ok' WHERE id = '$1 or ''1''=''1'"
        );

        let mut many: Vec<Option<&str>> = vec![Some("x"); 10];
        many[9] = Some("ten");
        many[0] = None;
        assert_eq!(inline_params("$10 $1", many.as_slice()), "'ten' NULL");
        assert_eq!(inline_params("'$1' $3 $", &params[..]), "'$1' $3 $");
    }

    #[test]
    fn booking_errors_carry_distinct_sqlstates() {
        let slot = SlotKey::new(chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), "10:00");
        let conflict = EngineError::SlotConflict {
            slot,
            reason: crate::engine::ConflictReason::Held,
        };
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::CertificationRequired), "P0003");
        assert_eq!(
            sqlstate(&EngineError::ResourceUnavailable(MachineStatus::Maintenance)),
            "55000"
        );
        assert_eq!(sqlstate(&EngineError::InvalidStatus("done".into())), "22P02");
        assert_eq!(sqlstate(&EngineError::Forbidden("x")), "42501");
        assert_eq!(sqlstate(&EngineError::Unauthorized), "28000");
    }

    #[test]
    fn describe_picks_schema_by_table() {
        assert_eq!(described_schema("SELECT * FROM slots WHERE machine_id = $1 AND date = $2").len(), 3);
        assert_eq!(described_schema("SELECT * FROM bookings").len(), 10);
        assert!(described_schema("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn held_slots_render_as_json() {
        let slots = ["2024-06-01-10:00", "2024-06-02-09:00"];
        assert_eq!(json_list(slots), r#"["2024-06-01-10:00","2024-06-02-09:00"]"#);
        assert_eq!(json_list(Vec::<String>::new()), "[]");
    }
}
