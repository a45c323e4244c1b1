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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::auth::SpotbookAuthSource;
use crate::engine::{DenyReason, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReviewScope, SqlError};

/// One handler per connection. `session` is the user this connection
/// logged in as; only a successful credential check sets it.
pub struct SpotbookHandler {
    engine: Arc<Engine>,
    session: Mutex<Option<UserId>>,
    query_parser: Arc<SpotbookQueryParser>,
}

impl SpotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            session: Mutex::new(None),
            query_parser: Arc::new(SpotbookQueryParser),
        }
    }

    async fn actor(&self) -> Option<UserId> {
        *self.session.lock().await
    }

    async fn run(&self, actor: Option<UserId>, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = cmd.label();
        tracing::debug!(command = label, actor = ?actor, "query");

        let start = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => {
                observability::record_rejection(e);
                match e {
                    EngineError::WalError(_) | EngineError::Internal(_) => {
                        tracing::error!(command = label, "{e}");
                    }
                    EngineError::InvalidCredentials => {
                        metrics::counter!(observability::LOGIN_FAILURES_TOTAL).increment(1);
                    }
                    _ => tracing::debug!(command = label, "rejected: {e}"),
                }
                "error"
            }
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        actor: Option<UserId>,
        cmd: Command,
    ) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser { id, username, email, first_name, last_name, password } => {
                engine
                    .create_user(id, username, email, first_name, last_name, password)
                    .await?;
                Ok(inserted())
            }
            Command::DeleteUser { id } => {
                engine.delete_user(actor, id).await?;
                *self.session.lock().await = None;
                Ok(deleted())
            }
            Command::SelectUser { id } => Ok(user_rows(engine.get_user(id).ok())),
            Command::SelectSession { login: None } => Ok(user_rows(engine.current_user(actor))),
            Command::SelectSession { login: Some((credential, password)) } => {
                let user = engine.verify_credentials(&credential, &password).await?;
                *self.session.lock().await = Some(user.id);
                tracing::debug!(user = %user.id, "session login");
                Ok(user_rows(Some(user)))
            }

            Command::InsertSpot { id, details } => {
                engine.create_spot(actor, id, details).await?;
                Ok(inserted())
            }
            Command::UpdateSpot { id, patch } => {
                engine.update_spot(actor, id, patch).await?;
                Ok(updated())
            }
            Command::DeleteSpot { id } => {
                engine.delete_spot(actor, id).await?;
                Ok(deleted())
            }
            Command::SelectSpots { filter } => Ok(spot_rows(engine.list_spots(&filter).await?)),

            Command::InsertSpotImage { id, spot_id, url, preview } => {
                engine.add_spot_image(actor, id, spot_id, url, preview).await?;
                Ok(inserted())
            }
            Command::DeleteSpotImage { id } => {
                engine.remove_spot_image(actor, id).await?;
                Ok(deleted())
            }
            Command::SelectSpotImages { spot_id } => {
                Ok(spot_image_rows(engine.get_spot_images(spot_id).await?))
            }

            Command::InsertReview { id, spot_id, review, stars } => {
                engine.create_review(actor, id, spot_id, review, stars).await?;
                Ok(inserted())
            }
            Command::UpdateReview { id, review, stars } => {
                engine.update_review(actor, id, review, stars).await?;
                Ok(updated())
            }
            Command::DeleteReview { id } => {
                engine.delete_review(actor, id).await?;
                Ok(deleted())
            }
            Command::SelectReviews { scope } => {
                let reviews = match scope {
                    ReviewScope::Spot(spot_id) => engine.get_reviews_for_spot(spot_id).await?,
                    ReviewScope::User(user_id) => engine.get_reviews_by_user(user_id).await,
                };
                Ok(review_rows(reviews))
            }

            Command::InsertReviewImage { id, review_id, url } => {
                engine.add_review_image(actor, id, review_id, url).await?;
                Ok(inserted())
            }
            Command::DeleteReviewImage { id } => {
                engine.remove_review_image(actor, id).await?;
                Ok(deleted())
            }
            Command::SelectReviewImages { review_id } => {
                Ok(review_image_rows(engine.get_review_images(review_id).await?))
            }

            Command::InsertBooking { id, spot_id, stay } => {
                engine.create_booking(actor, id, spot_id, stay).await?;
                Ok(inserted())
            }
            Command::UpdateBooking { id, start, end } => {
                engine.update_booking(actor, id, start, end).await?;
                Ok(updated())
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(actor, id).await?;
                Ok(deleted())
            }
            Command::SelectBookings { spot_id: Some(spot_id) } => {
                Ok(booking_rows(engine.get_bookings_for_spot(actor, spot_id).await?))
            }
            Command::SelectBookings { spot_id: None } => {
                Ok(booking_rows(engine.get_bookings_by_user(actor).await?))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("username", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("first_name", Type::VARCHAR),
        field("last_name", Type::VARCHAR),
    ]
}

fn spot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("city", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("country", Type::VARCHAR),
        field("lat", Type::FLOAT8),
        field("lng", Type::FLOAT8),
        field("name", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("price", Type::FLOAT8),
        field("avg_rating", Type::FLOAT8),
        field("num_reviews", Type::INT8),
        field("preview_image", Type::VARCHAR),
    ]
}

fn spot_image_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("spot_id", Type::VARCHAR),
        field("url", Type::VARCHAR),
        field("preview", Type::BOOL),
    ]
}

fn review_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("spot_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("review", Type::VARCHAR),
        field("stars", Type::INT4),
        field("num_images", Type::INT8),
    ]
}

fn review_image_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("review_id", Type::VARCHAR),
        field("url", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("spot_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start_date", Type::DATE),
        field("end_date", Type::DATE),
    ]
}

/// Result columns for `SELECT * FROM <table>`; empty for anything else.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("users" | "session") => user_schema(),
        Some("spots") => spot_schema(),
        Some("spot_images") => spot_image_schema(),
        Some("reviews") => review_schema(),
        Some("review_images") => review_image_schema(),
        Some("bookings") => booking_schema(),
        _ => Vec::new(),
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn user_rows(user: Option<UserInfo>) -> Response {
    rows(user_schema(), user.into_iter().collect(), |enc, u| {
        enc.encode_field(&u.id.to_string())?;
        enc.encode_field(&u.username)?;
        enc.encode_field(&u.email)?;
        enc.encode_field(&u.first_name)?;
        enc.encode_field(&u.last_name)
    })
}

fn spot_rows(spots: Vec<SpotInfo>) -> Response {
    rows(spot_schema(), spots, |enc, s| {
        enc.encode_field(&s.id.to_string())?;
        enc.encode_field(&s.owner_id.to_string())?;
        enc.encode_field(&s.details.address)?;
        enc.encode_field(&s.details.city)?;
        enc.encode_field(&s.details.state)?;
        enc.encode_field(&s.details.country)?;
        enc.encode_field(&s.details.lat)?;
        enc.encode_field(&s.details.lng)?;
        enc.encode_field(&s.details.name)?;
        enc.encode_field(&s.details.description)?;
        enc.encode_field(&s.details.price)?;
        enc.encode_field(&s.avg_rating)?;
        enc.encode_field(&(s.num_reviews as i64))?;
        enc.encode_field(&s.preview_image)
    })
}

fn spot_image_rows(images: Vec<SpotImage>) -> Response {
    rows(spot_image_schema(), images, |enc, i| {
        enc.encode_field(&i.id.to_string())?;
        enc.encode_field(&i.spot_id.to_string())?;
        enc.encode_field(&i.url)?;
        enc.encode_field(&i.preview)
    })
}

fn review_rows(reviews: Vec<ReviewInfo>) -> Response {
    rows(review_schema(), reviews, |enc, r| {
        enc.encode_field(&r.id.to_string())?;
        enc.encode_field(&r.spot_id.to_string())?;
        enc.encode_field(&r.user_id.to_string())?;
        enc.encode_field(&r.review)?;
        enc.encode_field(&i32::from(r.stars))?;
        enc.encode_field(&(r.image_urls.len() as i64))
    })
}

fn review_image_rows(images: Vec<ReviewImage>) -> Response {
    rows(review_image_schema(), images, |enc, i| {
        enc.encode_field(&i.id.to_string())?;
        enc.encode_field(&i.review_id.to_string())?;
        enc.encode_field(&i.url)
    })
}

/// Redacted rows carry NULL id and user_id.
fn booking_rows(bookings: Vec<BookingInfo>) -> Response {
    rows(booking_schema(), bookings, |enc, b| {
        enc.encode_field(&b.id.map(|id| id.to_string()))?;
        enc.encode_field(&b.spot_id.to_string())?;
        enc.encode_field(&b.user_id.map(|id| id.to_string()))?;
        enc.encode_field(&b.start.to_string())?;
        enc.encode_field(&b.end.to_string())
    })
}

#[async_trait]
impl SimpleQueryHandler for SpotbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor().await;
        Ok(vec![self.run(actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpotbookQueryParser;

#[async_trait]
impl QueryParser for SpotbookQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpotbookHandler {
    type Statement = String;
    type QueryParser = SpotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor().await;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(actor, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
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

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpotbookFactory {
    handler: Arc<SpotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SpotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SpotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let params = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SpotbookAuthSource::new(password),
                params,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotbookFactory {
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

/// Serve one client socket until it disconnects. Each socket gets its own
/// handler, so a login never leaks into another connection.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SpotbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidDateRange(_) => "22008",
        EngineError::Validation { .. } => "22023",
        EngineError::BookingConflict(_) => "23P01",
        EngineError::Forbidden(DenyReason::AuthenticationRequired) => "28000",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidCredentials => "28P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
        EngineError::Internal(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue { column, .. } if column.ends_with("_date") => "22007",
        SqlError::InvalidValue { .. } => "22P02",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        SqlError::MissingColumn(_) => "23502",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sql_sqlstate(&e).into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Conflict, DateRangeError};
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM spots"), 0);
        assert_eq!(count_params("UPDATE bookings SET end_date = $2 WHERE id = $1"), 2);
        assert_eq!(count_params("INSERT INTO t VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let params = vec![Some(b"O'Hare".to_vec()), None];
        let sql = substitute_params("INSERT INTO t (a, b) VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO t (a, b) VALUES ('O''Hare', NULL)");
    }

    #[test]
    fn substitute_ten_before_one() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        let sql = substitute_params("$1 $10", &params);
        assert_eq!(sql, "'1' '10'");
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let conflict = Conflict {
            booking_id: Ulid::new(),
            start_date: true,
            end_date: false,
        };
        assert_eq!(sqlstate(&EngineError::BookingConflict(conflict)), "23P01");
        assert_eq!(
            sqlstate(&EngineError::InvalidDateRange(DateRangeError::StartInPast)),
            "22008"
        );
        assert_eq!(
            sqlstate(&EngineError::Forbidden(DenyReason::AuthenticationRequired)),
            "28000"
        );
        assert_eq!(sqlstate(&EngineError::Forbidden(DenyReason::SelfBookingDenied)), "42501");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
    }

    #[test]
    fn bad_dates_get_datetime_sqlstate() {
        let e = SqlError::InvalidValue {
            column: "start_date".into(),
            message: "x".into(),
        };
        assert_eq!(sql_sqlstate(&e), "22007");
        assert_eq!(sql_sqlstate(&SqlError::UnknownTable("x".into())), "42P01");
    }

    #[test]
    fn describe_schema_by_table() {
        assert_eq!(schema_for("SELECT * FROM spots WHERE id = $1").len(), 14);
        assert_eq!(schema_for("SELECT * FROM session").len(), 5);
        assert!(schema_for("DELETE FROM spots WHERE id = $1").is_empty());
    }
}
