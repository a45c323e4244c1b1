use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: UserId,
        username: String,
        email: String,
        first_name: String,
        last_name: String,
        password: String,
    },
    DeleteUser {
        id: UserId,
    },
    SelectUser {
        id: UserId,
    },
    /// No login: report the connection's own user.
    SelectSession {
        login: Option<(String, String)>,
    },
    InsertSpot {
        id: SpotId,
        details: SpotDetails,
    },
    UpdateSpot {
        id: SpotId,
        patch: SpotPatch,
    },
    DeleteSpot {
        id: SpotId,
    },
    SelectSpots {
        filter: SpotFilter,
    },
    InsertSpotImage {
        id: ImageId,
        spot_id: SpotId,
        url: String,
        preview: bool,
    },
    DeleteSpotImage {
        id: ImageId,
    },
    SelectSpotImages {
        spot_id: SpotId,
    },
    InsertReview {
        id: ReviewId,
        spot_id: SpotId,
        review: String,
        stars: i64,
    },
    UpdateReview {
        id: ReviewId,
        review: Option<String>,
        stars: Option<i64>,
    },
    DeleteReview {
        id: ReviewId,
    },
    SelectReviews {
        scope: ReviewScope,
    },
    InsertReviewImage {
        id: ImageId,
        review_id: ReviewId,
        url: String,
    },
    DeleteReviewImage {
        id: ImageId,
    },
    SelectReviewImages {
        review_id: ReviewId,
    },
    InsertBooking {
        id: BookingId,
        spot_id: SpotId,
        stay: Stay,
    },
    UpdateBooking {
        id: BookingId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    DeleteBooking {
        id: BookingId,
    },
    /// `None` lists the connection user's own bookings.
    SelectBookings {
        spot_id: Option<SpotId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewScope {
    Spot(SpotId),
    User(UserId),
}

impl Command {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Command::InsertUser { .. } => "insert_user",
            Command::DeleteUser { .. } => "delete_user",
            Command::SelectUser { .. } => "select_user",
            Command::SelectSession { login: None } => "select_session",
            Command::SelectSession { login: Some(_) } => "login",
            Command::InsertSpot { .. } => "insert_spot",
            Command::UpdateSpot { .. } => "update_spot",
            Command::DeleteSpot { .. } => "delete_spot",
            Command::SelectSpots { .. } => "select_spots",
            Command::InsertSpotImage { .. } => "insert_spot_image",
            Command::DeleteSpotImage { .. } => "delete_spot_image",
            Command::SelectSpotImages { .. } => "select_spot_images",
            Command::InsertReview { .. } => "insert_review",
            Command::UpdateReview { .. } => "update_review",
            Command::DeleteReview { .. } => "delete_review",
            Command::SelectReviews { .. } => "select_reviews",
            Command::InsertReviewImage { .. } => "insert_review_image",
            Command::DeleteReviewImage { .. } => "delete_review_image",
            Command::SelectReviewImages { .. } => "select_review_images",
            Command::InsertBooking { .. } => "insert_booking",
            Command::UpdateBooking { .. } => "update_booking",
            Command::DeleteBooking { .. } => "delete_booking",
            Command::SelectBookings { .. } => "select_bookings",
        }
    }
}

const USER_COLUMNS: &[&str] = &["id", "username", "email", "first_name", "last_name", "password"];
const SPOT_COLUMNS: &[&str] = &[
    "id", "address", "city", "state", "country", "lat", "lng", "name", "description", "price",
];
const SPOT_IMAGE_COLUMNS: &[&str] = &["id", "spot_id", "url", "preview"];
const REVIEW_COLUMNS: &[&str] = &["id", "spot_id", "review", "stars"];
const REVIEW_IMAGE_COLUMNS: &[&str] = &["id", "review_id", "url"];
const BOOKING_COLUMNS: &[&str] = &["id", "spot_id", "start_date", "end_date"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(insert: &'a ast::Insert, table: &str, columns: &[&str]) -> Result<Self, SqlError> {
        let values = insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if names.len() != values.len() {
            return Err(SqlError::WrongArity(table.to_string(), names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !columns.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self {
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    /// A column that is absent or NULL is `None`.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
            .filter(|expr| !is_null(expr))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string(column, self.require(column)?)
    }

    /// `id` is optional; a fresh ULID stands in when it is left out.
    fn id(&self) -> Result<Ulid, SqlError> {
        match self.get("id") {
            Some(expr) => parse_ulid("id", expr),
            None => Ok(Ulid::new()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::new(insert, &table, USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: row.id()?,
                username: row.text("username")?,
                email: row.text("email")?,
                first_name: row.text("first_name")?,
                last_name: row.text("last_name")?,
                password: row.text("password")?,
            })
        }
        "spots" => {
            let row = Row::new(insert, &table, SPOT_COLUMNS)?;
            Ok(Command::InsertSpot {
                id: row.id()?,
                details: SpotDetails {
                    address: row.text("address")?,
                    city: row.text("city")?,
                    state: row.text("state")?,
                    country: row.text("country")?,
                    lat: parse_f64("lat", row.require("lat")?)?,
                    lng: parse_f64("lng", row.require("lng")?)?,
                    name: row.text("name")?,
                    description: row.text("description")?,
                    price: parse_f64("price", row.require("price")?)?,
                },
            })
        }
        "spot_images" => {
            let row = Row::new(insert, &table, SPOT_IMAGE_COLUMNS)?;
            Ok(Command::InsertSpotImage {
                id: row.id()?,
                spot_id: parse_ulid("spot_id", row.require("spot_id")?)?,
                url: row.text("url")?,
                preview: row.get("preview").map(|e| parse_bool("preview", e)).transpose()?.unwrap_or(false),
            })
        }
        "reviews" => {
            let row = Row::new(insert, &table, REVIEW_COLUMNS)?;
            Ok(Command::InsertReview {
                id: row.id()?,
                spot_id: parse_ulid("spot_id", row.require("spot_id")?)?,
                review: row.text("review")?,
                stars: parse_i64("stars", row.require("stars")?)?,
            })
        }
        "review_images" => {
            let row = Row::new(insert, &table, REVIEW_IMAGE_COLUMNS)?;
            Ok(Command::InsertReviewImage {
                id: row.id()?,
                review_id: parse_ulid("review_id", row.require("review_id")?)?,
                url: row.text("url")?,
            })
        }
        "bookings" => {
            let row = Row::new(insert, &table, BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                id: row.id()?,
                spot_id: parse_ulid("spot_id", row.require("spot_id")?)?,
                stay: Stay::new(
                    parse_date("start_date", row.require("start_date")?)?,
                    parse_date("end_date", row.require("end_date")?)?,
                ),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.push((column, &a.value));
    }

    match table.as_str() {
        "spots" => {
            let mut patch = SpotPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "address" => patch.address = Some(parse_string("address", value)?),
                    "city" => patch.city = Some(parse_string("city", value)?),
                    "state" => patch.state = Some(parse_string("state", value)?),
                    "country" => patch.country = Some(parse_string("country", value)?),
                    "lat" => patch.lat = Some(parse_f64("lat", value)?),
                    "lng" => patch.lng = Some(parse_f64("lng", value)?),
                    "name" => patch.name = Some(parse_string("name", value)?),
                    "description" => patch.description = Some(parse_string("description", value)?),
                    "price" => patch.price = Some(parse_f64("price", value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateSpot { id, patch })
        }
        "reviews" => {
            let (mut review, mut stars) = (None, None);
            for (column, value) in set {
                match column.as_str() {
                    "review" => review = Some(parse_string("review", value)?),
                    "stars" => stars = Some(parse_i64("stars", value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateReview { id, review, stars })
        }
        "bookings" => {
            let (mut start, mut end) = (None, None);
            for (column, value) in set {
                match column.as_str() {
                    "start_date" => start = Some(parse_date("start_date", value)?),
                    "end_date" => end = Some(parse_date("end_date", value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateBooking { id, start, end })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
        "spots" => Ok(Command::DeleteSpot { id }),
        "spot_images" => Ok(Command::DeleteSpotImage { id }),
        "reviews" => Ok(Command::DeleteReview { id }),
        "review_images" => Ok(Command::DeleteReviewImage { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// A flat list of `column <op> value` terms joined by AND.
struct Filters<'a> {
    terms: Vec<(String, Cmp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn new(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn get(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, e)| *e)
    }

    fn eq_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column, Cmp::Eq).map(|e| parse_ulid(column, e)).transpose()
    }

    fn bound(&self, column: &'static str, cmp: Cmp) -> Result<Option<f64>, SqlError> {
        self.get(column, cmp).map(|e| parse_f64(column, e)).transpose()
    }

    fn page(&self, column: &'static str) -> Result<Option<u32>, SqlError> {
        self.get(column, Cmp::Eq)
            .map(|e| {
                let v = parse_i64(column, e)?;
                u32::try_from(v).map_err(|_| SqlError::invalid(column, format!("{v} is out of range")))
            })
            .transpose()
    }

    /// Reject filters on columns the table doesn't support.
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.terms.iter().find(|(c, _, _)| !allowed.contains(&c.as_str())) {
            Some((c, _, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    }
}

fn collect_terms<'a>(expr: &'a Expr, out: &mut Vec<(String, Cmp, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_terms(left, out)?;
                    return collect_terms(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, cmp, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::new(&select.selection)?;

    match table.as_str() {
        "session" => {
            filters.only(&["credential", "password"])?;
            let credential = filters.get("credential", Cmp::Eq);
            let password = filters.get("password", Cmp::Eq);
            let login = match (credential, password) {
                (None, None) => None,
                (Some(c), Some(p)) => Some((parse_string("credential", c)?, parse_string("password", p)?)),
                (None, Some(_)) => return Err(SqlError::MissingFilter("credential")),
                (Some(_), None) => return Err(SqlError::MissingFilter("password")),
            };
            Ok(Command::SelectSession { login })
        }
        "users" => {
            filters.only(&["id"])?;
            let id = filters.eq_ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::SelectUser { id })
        }
        "spots" => {
            filters.only(&["id", "owner_id", "page", "size", "lat", "lng", "price"])?;
            Ok(Command::SelectSpots {
                filter: SpotFilter {
                    id: filters.eq_ulid("id")?,
                    owner_id: filters.eq_ulid("owner_id")?,
                    page: filters.page("page")?,
                    size: filters.page("size")?,
                    min_lat: filters.bound("lat", Cmp::GtEq)?,
                    max_lat: filters.bound("lat", Cmp::LtEq)?,
                    min_lng: filters.bound("lng", Cmp::GtEq)?,
                    max_lng: filters.bound("lng", Cmp::LtEq)?,
                    min_price: filters.bound("price", Cmp::GtEq)?,
                    max_price: filters.bound("price", Cmp::LtEq)?,
                },
            })
        }
        "spot_images" => {
            filters.only(&["spot_id"])?;
            let spot_id = filters.eq_ulid("spot_id")?.ok_or(SqlError::MissingFilter("spot_id"))?;
            Ok(Command::SelectSpotImages { spot_id })
        }
        "reviews" => {
            filters.only(&["spot_id", "user_id"])?;
            let scope = match (filters.eq_ulid("spot_id")?, filters.eq_ulid("user_id")?) {
                (Some(spot), _) => ReviewScope::Spot(spot),
                (None, Some(user)) => ReviewScope::User(user),
                (None, None) => return Err(SqlError::MissingFilter("spot_id")),
            };
            Ok(Command::SelectReviews { scope })
        }
        "review_images" => {
            filters.only(&["review_id"])?;
            let review_id = filters.eq_ulid("review_id")?.ok_or(SqlError::MissingFilter("review_id"))?;
            Ok(Command::SelectReviewImages { review_id })
        }
        "bookings" => {
            filters.only(&["spot_id"])?;
            Ok(Command::SelectBookings { spot_id: filters.eq_ulid("spot_id")? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Table a SELECT reads from, for describing results before execution.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right })
            if expr_column_name(left).as_deref() == Some("id") =>
        {
            parse_ulid("id", right)
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Literal text of a string or number, with a leading minus folded in.
fn literal(column: &str, expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(format!("-{}", literal(column, expr)?));
    }
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Boolean(b)) => Ok(b.to_string()),
        Some(other) => Err(SqlError::invalid(column, format!("unexpected value {other}"))),
        None => Err(SqlError::invalid(column, format!("expected a literal, got {expr}"))),
    }
}

fn parse_string(column: &str, expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::invalid(column, "expected a quoted string")),
    }
}

fn parse_ulid(column: &str, expr: &Expr) -> Result<Ulid, SqlError> {
    let text = literal(column, expr)?;
    Ulid::from_string(&text).map_err(|e| SqlError::invalid(column, format!("bad ULID: {e}")))
}

fn parse_i64(column: &str, expr: &Expr) -> Result<i64, SqlError> {
    let text = literal(column, expr)?;
    text.trim()
        .parse()
        .map_err(|_| SqlError::invalid(column, format!("{text} is not an integer")))
}

fn parse_f64(column: &str, expr: &Expr) -> Result<f64, SqlError> {
    let text = literal(column, expr)?;
    match text.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(SqlError::invalid(column, format!("{text} is not a number"))),
    }
}

fn parse_bool(column: &str, expr: &Expr) -> Result<bool, SqlError> {
    let text = literal(column, expr)?;
    match text.to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(SqlError::invalid(column, format!("{text} is not a boolean"))),
    }
}

/// `YYYY-MM-DD`; anything else is an invalid date for `column`.
fn parse_date(column: &str, expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = literal(column, expr)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::invalid(column, format!("{text} is not a valid date")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(String, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    InvalidValue { column: String, message: String },
}

impl SqlError {
    fn invalid(column: &str, message: impl Into<String>) -> Self {
        SqlError::InvalidValue {
            column: column.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(c) => write!(f, "{c} is required"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue { column, message } => write!(f, "{column}: {message}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn insert_user_by_column_name() {
        let sql = "INSERT INTO users (email, username, password, first_name, last_name) \
                   VALUES ('demo@user.io', 'demo-lition', 'password', 'Demo', 'Lition')";
        match parse_sql(sql).unwrap() {
            Command::InsertUser { username, email, password, first_name, last_name, .. } => {
                assert_eq!(username, "demo-lition");
                assert_eq!(email, "demo@user.io");
                assert_eq!(password, "password");
                assert_eq!(first_name, "Demo");
                assert_eq!(last_name, "Lition");
            }
            other => panic!("expected InsertUser, got {other:?}"),
        }
    }

    #[test]
    fn insert_without_columns_is_positional() {
        let sql = format!("INSERT INTO bookings VALUES ('{ID}', '{OTHER}', '2030-02-05', '2030-02-10')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: Ulid::from_string(ID).unwrap(),
                spot_id: Ulid::from_string(OTHER).unwrap(),
                stay: Stay::new(date("2030-02-05"), date("2030-02-10")),
            }
        );
    }

    #[test]
    fn missing_id_gets_generated() {
        let sql = format!("INSERT INTO reviews (spot_id, review, stars) VALUES ('{OTHER}', 'Great', 5)");
        let a = parse_sql(&sql).unwrap();
        let b = parse_sql(&sql).unwrap();
        match (a, b) {
            (Command::InsertReview { id: a, stars, .. }, Command::InsertReview { id: b, .. }) => {
                assert_ne!(a, b);
                assert_eq!(stars, 5);
            }
            other => panic!("expected two InsertReview, got {other:?}"),
        }
    }

    #[test]
    fn insert_spot_with_negative_coordinates() {
        let sql = "INSERT INTO spots (address, city, state, country, lat, lng, name, description, price) \
                   VALUES ('123 Disney Lane', 'San Francisco', 'California', 'USA', 37.76, -122.47, 'App Academy', 'Place', '123')";
        match parse_sql(sql).unwrap() {
            Command::InsertSpot { details, .. } => {
                assert_eq!(details.lat, 37.76);
                assert_eq!(details.lng, -122.47);
                assert_eq!(details.price, 123.0);
            }
            other => panic!("expected InsertSpot, got {other:?}"),
        }
    }

    #[test]
    fn spot_image_preview_defaults_false() {
        let sql = format!("INSERT INTO spot_images (spot_id, url) VALUES ('{OTHER}', 'https://img/1.jpg')");
        match parse_sql(&sql).unwrap() {
            Command::InsertSpotImage { preview, url, .. } => {
                assert!(!preview);
                assert_eq!(url, "https://img/1.jpg");
            }
            other => panic!("expected InsertSpotImage, got {other:?}"),
        }
        let sql = format!("INSERT INTO spot_images (spot_id, url, preview) VALUES ('{OTHER}', 'u', true)");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertSpotImage { preview: true, .. }));
    }

    #[test]
    fn insert_errors() {
        let sql = "INSERT INTO bookings (spot_id, start_date) VALUES ('x')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity(_, 2, 1))));

        let sql = format!("INSERT INTO bookings (spot_id, start_date) VALUES ('{OTHER}', '2030-01-01')");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingColumn("end_date")));

        let sql = format!("INSERT INTO bookings (spot_id, nights) VALUES ('{OTHER}', 3)");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownColumn("nights".into())));

        assert_eq!(
            parse_sql("INSERT INTO resources (id) VALUES ('x')"),
            Err(SqlError::UnknownTable("resources".into()))
        );
    }

    #[test]
    fn invalid_date_names_the_column() {
        let sql = format!(
            "INSERT INTO bookings (spot_id, start_date, end_date) VALUES ('{OTHER}', '2030-02-30', '2030-03-02')"
        );
        match parse_sql(&sql) {
            Err(SqlError::InvalidValue { column, .. }) => assert_eq!(column, "start_date"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
        let sql = format!("UPDATE bookings SET end_date = 'soon' WHERE id = '{ID}'");
        match parse_sql(&sql) {
            Err(SqlError::InvalidValue { column, .. }) => assert_eq!(column, "end_date"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn update_spot_builds_patch() {
        let sql = format!("UPDATE spots SET price = 200, name = 'Renamed' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSpot {
                id: Ulid::from_string(ID).unwrap(),
                patch: SpotPatch {
                    price: Some(200.0),
                    name: Some("Renamed".into()),
                    ..Default::default()
                },
            }
        );
        let sql = format!("UPDATE spots SET owner_id = '{OTHER}' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownColumn("owner_id".into())));
    }

    #[test]
    fn update_booking_one_end() {
        let sql = format!("UPDATE bookings SET end_date = '2030-02-12' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBooking {
                id: Ulid::from_string(ID).unwrap(),
                start: None,
                end: Some(date("2030-02-12")),
            }
        );
    }

    #[test]
    fn update_review_and_missing_where() {
        let sql = format!("UPDATE reviews SET stars = 3 WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReview { review: None, stars: Some(3), .. }
        ));
        assert_eq!(
            parse_sql("UPDATE reviews SET stars = 3"),
            Err(SqlError::MissingFilter("id"))
        );
    }

    #[test]
    fn delete_by_id() {
        for (table, expect) in [
            ("users", "delete_user"),
            ("spots", "delete_spot"),
            ("spot_images", "delete_spot_image"),
            ("reviews", "delete_review"),
            ("review_images", "delete_review_image"),
            ("bookings", "delete_booking"),
        ] {
            let cmd = parse_sql(&format!("DELETE FROM {table} WHERE id = '{ID}'")).unwrap();
            assert_eq!(cmd.label(), expect);
        }
        assert_eq!(
            parse_sql("DELETE FROM bookings WHERE spot_id = 'x'"),
            Err(SqlError::MissingFilter("id"))
        );
    }

    #[test]
    fn select_session_and_login() {
        assert_eq!(
            parse_sql("SELECT * FROM session").unwrap(),
            Command::SelectSession { login: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM session WHERE credential = 'demo@user.io' AND password = 'password'").unwrap(),
            Command::SelectSession {
                login: Some(("demo@user.io".into(), "password".into()))
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM session WHERE credential = 'demo'"),
            Err(SqlError::MissingFilter("password"))
        );
    }

    #[test]
    fn select_spots_filters() {
        let sql = "SELECT * FROM spots WHERE page = 2 AND size = 5 AND price >= 10 AND price <= 99.5 \
                   AND (lat >= -10 AND lat <= 40)";
        match parse_sql(sql).unwrap() {
            Command::SelectSpots { filter } => {
                assert_eq!(filter.page, Some(2));
                assert_eq!(filter.size, Some(5));
                assert_eq!(filter.min_price, Some(10.0));
                assert_eq!(filter.max_price, Some(99.5));
                assert_eq!(filter.min_lat, Some(-10.0));
                assert_eq!(filter.max_lat, Some(40.0));
                assert_eq!(filter.min_lng, None);
            }
            other => panic!("expected SelectSpots, got {other:?}"),
        }
        assert_eq!(
            parse_sql("SELECT * FROM spots").unwrap(),
            Command::SelectSpots { filter: SpotFilter::default() }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM spots WHERE price > 10"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_reviews_scope() {
        let sql = format!("SELECT * FROM reviews WHERE user_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReviews { scope: ReviewScope::User(Ulid::from_string(ID).unwrap()) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM reviews"),
            Err(SqlError::MissingFilter("spot_id"))
        );
    }

    #[test]
    fn select_bookings_with_and_without_spot() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { spot_id: None }
        );
        let sql = format!("SELECT * FROM bookings WHERE spot_id = '{OTHER}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings { spot_id: Some(Ulid::from_string(OTHER).unwrap()) }
        );
    }

    #[test]
    fn select_table_for_describe() {
        assert_eq!(select_table("SELECT * FROM spots WHERE id = $1").as_deref(), Some("spots"));
        assert_eq!(select_table("DELETE FROM spots WHERE id = $1"), None);
        assert_eq!(select_table("nonsense"), None);
    }

    #[test]
    fn garbage_and_empty() {
        assert!(matches!(parse_sql("SELEKT nope"), Err(SqlError::Parse(_))));
        assert_eq!(parse_sql(""), Err(SqlError::Empty));
        assert!(matches!(parse_sql("CREATE TABLE t (a int)"), Err(SqlError::Unsupported(_))));
    }
}
