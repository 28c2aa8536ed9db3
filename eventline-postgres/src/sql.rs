//! Compiles store criteria to parameterised SQL.

use eventline::errors::StoreResult;
use eventline::store::{Criteria, Criterion, StreamPattern};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

/// A value bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    /// `TEXT`
    Text(String),
    /// `BIGINT`
    BigInt(i64),
    /// `BOOLEAN`
    Bool(bool),
    /// `TEXT[]`
    TextArray(Vec<String>),
}

/// A conjunction of SQL conditions with their bound values.
///
/// Placeholders are numbered in push order, starting at `$1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlFilter {
    conditions: Vec<String>,
    binds: Vec<Bind>,
}

impl SqlFilter {
    /// Compiles `criteria` against the `eventline_events` columns.
    ///
    /// Stream patterns other than an exact name or a single trailing `*`
    /// are rejected before any query is sent.
    pub fn build_where(criteria: &Criteria) -> StoreResult<Self> {
        let mut filter = Self::default();
        for criterion in criteria.iter() {
            match criterion {
                Criterion::StreamName(raw) => match StreamPattern::parse(raw)? {
                    StreamPattern::Exact(name) => filter.push("stream_name = {}", Bind::Text(name)),
                    StreamPattern::Prefix(prefix) => filter.push(
                        "stream_name LIKE {} ESCAPE '\\'",
                        Bind::Text(format!("{}%", escape_like(&prefix))),
                    ),
                },
                Criterion::FromIndex(index) => {
                    filter.push("idx > {}", Bind::BigInt(to_bigint(*index)));
                }
                Criterion::FromPlayhead(playhead) => {
                    filter.push("playhead > {}", Bind::BigInt(to_bigint(*playhead)));
                }
                Criterion::Archived(archived) => filter.push("archived = {}", Bind::Bool(*archived)),
                Criterion::EventTypes(types) => {
                    filter.push("event_type = ANY({})", Bind::TextArray(types.clone()));
                }
            }
        }
        Ok(filter)
    }

    /// Adds `condition`, where `{}` stands for the next placeholder.
    pub fn push(&mut self, condition: &str, bind: Bind) {
        self.binds.push(bind);
        let placeholder = format!("${}", self.binds.len());
        self.conditions.push(condition.replace("{}", &placeholder));
    }

    /// The next free placeholder, for clauses appended after the filter.
    pub fn next_placeholder(&self) -> String {
        format!("${}", self.binds.len() + 1)
    }

    /// ` WHERE ...`, or an empty string when there are no conditions.
    pub fn where_sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    /// The bound values in placeholder order.
    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    /// Binds every value to `query`, in placeholder order.
    pub(crate) fn bind_to<'q>(
        &self,
        mut query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        for bind in &self.binds {
            query = match bind {
                Bind::Text(value) => query.bind(value.clone()),
                Bind::BigInt(value) => query.bind(*value),
                Bind::Bool(value) => query.bind(*value),
                Bind::TextArray(values) => query.bind(values.clone()),
            };
        }
        query
    }
}

/// Escapes `LIKE` wildcards so prefixes match literally.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Indices and playheads beyond `i64::MAX` cannot exist in a `BIGINT` column.
pub(crate) fn to_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
