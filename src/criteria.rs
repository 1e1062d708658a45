//! Data-driven query filters.
//!
//! A [`Criterion`] is a pure description of one filter or pagination
//! directive. [`apply_criteria`] folds an ordered sequence of them into any
//! [`Queryable`], left to right: a criterion with `or == false` is ANDed with
//! everything accumulated so far, one with `or == true` is ORed with it. There
//! is no grouping, so `[a, b, c.or(), d]` means `((a AND b) OR c) AND d`.

use rusqlite::types::Value;

use crate::error::CriteriaError;

/// Window size used when a `Limit` is absent from a [`Pagination`] or is not
/// positive.
pub const DEFAULT_LIMIT: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Not,
    Like,
    Limit,
    Offset,
}

impl Operator {
    /// Limit and Offset shape the result window instead of filtering rows.
    pub fn is_window(self) -> bool {
        matches!(self, Operator::Limit | Operator::Offset)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    One(Value),
    Many(Vec<Value>),
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::One(value)
    }
}

impl From<Vec<Value>> for Operand {
    fn from(values: Vec<Value>) -> Self {
        Operand::Many(values)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Criterion {
    field: String,
    operator: Operator,
    operand: Operand,
    or: bool,
}

impl Criterion {
    pub fn new(field: impl Into<String>, operator: Operator, operand: impl Into<Operand>) -> Self {
        Self {
            field: field.into(),
            operator,
            operand: operand.into(),
            or: false,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value.into())
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Gt, value.into())
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Lt, value.into())
    }

    pub fn at_least(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Gte, value.into())
    }

    pub fn at_most(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Lte, value.into())
    }

    /// The pattern is bound as given; wrapping it in `%` is up to the caller.
    pub fn like(field: impl Into<String>, pattern: impl Into<Value>) -> Self {
        Self::new(field, Operator::Like, pattern.into())
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Not, value.into())
    }

    pub fn any_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(field, Operator::In, values)
    }

    pub fn limit(limit: i64) -> Self {
        Self::new("", Operator::Limit, Value::Integer(limit))
    }

    pub fn offset(offset: i64) -> Self {
        Self::new("", Operator::Offset, Value::Integer(offset))
    }

    /// Returns the same criterion, ORed against the accumulated predicate
    /// instead of ANDed.
    pub fn or(mut self) -> Self {
        self.or = true;
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    pub fn is_or(&self) -> bool {
        self.or
    }

    /// Validates the criterion and resolves it into what it does to a query.
    pub fn directive(&self) -> Result<Directive, CriteriaError> {
        if self.operator.is_window() {
            return match &self.operand {
                Operand::One(Value::Integer(n)) if self.operator == Operator::Limit => Ok(Directive::Limit(*n)),
                Operand::One(Value::Integer(n)) => Ok(Directive::Offset(*n)),
                _ => Err(CriteriaError::NonIntegerWindow(self.operator)),
            };
        }

        let field = self.checked_field()?;
        let comparison = match (self.operator, &self.operand) {
            (Operator::In, Operand::Many(values)) => Comparison::In(field, values.clone()),
            (Operator::In, Operand::One(_)) => return Err(self.mismatch(field, "a list of values")),
            (_, Operand::Many(_)) => return Err(self.mismatch(field, "a single value")),
            (Operator::Eq, Operand::One(v)) => Comparison::Eq(field, v.clone()),
            (Operator::Gt, Operand::One(v)) => Comparison::Gt(field, v.clone()),
            (Operator::Lt, Operand::One(v)) => Comparison::Lt(field, v.clone()),
            (Operator::Gte, Operand::One(v)) => Comparison::Gte(field, v.clone()),
            (Operator::Lte, Operand::One(v)) => Comparison::Lte(field, v.clone()),
            (Operator::Like, Operand::One(v)) => Comparison::Like(field, v.clone()),
            (Operator::Not, Operand::One(v)) => Comparison::Not(field, v.clone()),
            (Operator::Limit | Operator::Offset, _) => return Err(CriteriaError::NonIntegerWindow(self.operator)),
        };
        Ok(Directive::Filter(Predicate::Compare(comparison)))
    }

    fn checked_field(&self) -> Result<String, CriteriaError> {
        if self.field.is_empty() {
            return Err(CriteriaError::MissingField(self.operator));
        }
        if !is_identifier_path(&self.field) {
            return Err(CriteriaError::InvalidField(self.field.clone()));
        }
        Ok(self.field.clone())
    }

    fn mismatch(&self, field: String, expected: &'static str) -> CriteriaError {
        CriteriaError::OperandMismatch {
            field,
            operator: self.operator,
            expected,
        }
    }
}

/// `name` or `table.name`, each part `[A-Za-z_][A-Za-z0-9_]*`. Field names
/// are spliced into SQL text, values never are.
fn is_identifier_path(field: &str) -> bool {
    let parts: Vec<&str> = field.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    Filter(Predicate),
    Limit(i64),
    Offset(i64),
}

/// A single rendered comparison. The set is closed: adding an operator means
/// adding a variant here and a rendering arm below.
#[derive(Clone, Debug, PartialEq)]
pub enum Comparison {
    Eq(String, Value),
    Gt(String, Value),
    Lt(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    Like(String, Value),
    Not(String, Value),
    In(String, Vec<Value>),
}

impl Comparison {
    fn write_sql(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Comparison::Eq(field, value) => write_binary(sql, params, field, "=", value),
            Comparison::Gt(field, value) => write_binary(sql, params, field, ">", value),
            Comparison::Lt(field, value) => write_binary(sql, params, field, "<", value),
            Comparison::Gte(field, value) => write_binary(sql, params, field, ">=", value),
            Comparison::Lte(field, value) => write_binary(sql, params, field, "<=", value),
            Comparison::Like(field, value) => write_binary(sql, params, field, "LIKE", value),
            Comparison::Not(field, value) => {
                sql.push_str("NOT ");
                write_binary(sql, params, field, "=", value);
            }
            Comparison::In(field, values) => {
                let placeholders = vec!["?"; values.len()].join(", ");
                sql.push_str(&format!("{} IN ({})", field, placeholders));
                params.extend(values.iter().cloned());
            }
        }
    }
}

fn write_binary(sql: &mut String, params: &mut Vec<Value>, field: &str, op: &str, value: &Value) {
    sql.push_str(&format!("{} {} ?", field, op));
    params.push(value.clone());
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare(Comparison),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// One AND step of the fold. With nothing accumulated the next predicate
    /// stands alone.
    pub fn fold_and(acc: Option<Predicate>, next: Predicate) -> Predicate {
        match acc {
            Some(acc) => acc.and(next),
            None => next,
        }
    }

    /// One OR step of the fold.
    pub fn fold_or(acc: Option<Predicate>, next: Predicate) -> Predicate {
        match acc {
            Some(acc) => acc.or(next),
            None => next,
        }
    }

    /// Renders the predicate as a SQL boolean expression with `?`
    /// placeholders, returning the values to bind in placeholder order.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.write_sql(&mut sql, &mut params);
        (sql, params)
    }

    fn write_sql(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Predicate::Compare(comparison) => comparison.write_sql(sql, params),
            Predicate::And(left, right) => Self::write_group(sql, params, left, "AND", right),
            Predicate::Or(left, right) => Self::write_group(sql, params, left, "OR", right),
        }
    }

    fn write_group(sql: &mut String, params: &mut Vec<Value>, left: &Predicate, op: &str, right: &Predicate) {
        sql.push('(');
        left.write_sql(sql, params);
        sql.push(' ');
        sql.push_str(op);
        sql.push(' ');
        right.write_sql(sql, params);
        sql.push(')');
    }
}

/// Anything criteria can be folded into.
pub trait Queryable {
    type Output;

    /// ANDs the predicate with the accumulated one.
    fn filter(&mut self, predicate: Predicate);

    /// ORs the predicate with the accumulated one.
    fn or_filter(&mut self, predicate: Predicate);

    fn limit(&mut self, limit: i64);

    fn offset(&mut self, offset: i64);

    fn fetch(&self) -> anyhow::Result<Self::Output>;
}

/// Folds `criteria` into `query` in order. Window directives may appear
/// anywhere in the sequence; a non-positive limit becomes [`DEFAULT_LIMIT`]
/// and a negative offset becomes 0.
pub fn apply_criteria<Q: Queryable>(mut query: Q, criteria: &[Criterion]) -> Result<Q, CriteriaError> {
    for criterion in criteria {
        apply_criterion(&mut query, criterion)?;
    }
    Ok(query)
}

pub fn apply_criterion<Q: Queryable>(query: &mut Q, criterion: &Criterion) -> Result<(), CriteriaError> {
    match criterion.directive()? {
        Directive::Limit(limit) if limit <= 0 => query.limit(DEFAULT_LIMIT),
        Directive::Limit(limit) => query.limit(limit),
        Directive::Offset(offset) => query.offset(offset.max(0)),
        Directive::Filter(predicate) if criterion.is_or() => query.or_filter(predicate),
        Directive::Filter(predicate) => query.filter(predicate),
    }
    Ok(())
}

/// Page-number pagination as request parameters carry it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64) -> Self {
        Self { page, limit }
    }

    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }

    pub fn effective_page(&self) -> i64 {
        self.page.max(1)
    }

    /// Saturates at `i64::MAX` for pages past any real result set, which
    /// yields an empty page rather than an overflow.
    pub fn effective_offset(&self) -> i64 {
        (self.effective_page() - 1).saturating_mul(self.effective_limit())
    }

    /// The trailing `[Limit, Offset]` pair appended after filter criteria.
    pub fn to_criteria(&self) -> [Criterion; 2] {
        [
            Criterion::limit(self.effective_limit()),
            Criterion::offset(self.effective_offset()),
        ]
    }
}
