use std::marker::PhantomData;

use anyhow::Result;
use rusqlite::types::Value;

use crate::criteria::{Predicate, Queryable};
use crate::db::{Db, Entity};

/// A `SELECT * FROM <table>` that criteria fold into. Rows come back in a
/// stable order so the same criteria against the same data give the same
/// page every time.
pub struct SelectQuery<'a, E> {
    db: &'a Db,
    table: String,
    scope: Option<String>,
    predicate: Option<Predicate>,
    order_by: String,
    limit: Option<i64>,
    offset: Option<i64>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> SelectQuery<'a, E> {
    pub fn new(db: &'a Db, table: &str) -> Self {
        Self {
            db,
            table: table.to_string(),
            scope: None,
            predicate: None,
            order_by: "id".to_string(),
            limit: None,
            offset: None,
            _entity: PhantomData,
        }
    }

    /// A fixed condition ANDed outside the folded predicate, so an OR
    /// criterion can never widen the query past it.
    pub fn scoped(mut self, clause: &str) -> Self {
        self.scope = Some(clause.to_string());
        self
    }

    pub fn order_by(mut self, order_by: &str) -> Self {
        self.order_by = order_by.to_string();
        self
    }

    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT * FROM {}", self.table);
        let mut params = Vec::new();

        let predicate = self.predicate.as_ref().map(Predicate::to_sql);
        match (&self.scope, predicate) {
            (Some(scope), Some((where_sql, where_params))) => {
                sql.push_str(&format!(" WHERE {} AND ({})", scope, where_sql));
                params = where_params;
            }
            (Some(scope), None) => sql.push_str(&format!(" WHERE {}", scope)),
            (None, Some((where_sql, where_params))) => {
                sql.push_str(&format!(" WHERE {}", where_sql));
                params = where_params;
            }
            (None, None) => {}
        }

        sql.push_str(&format!(" ORDER BY {}", self.order_by));
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            // SQLite only takes OFFSET after a LIMIT; -1 means no limit.
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }
        (sql, params)
    }
}

impl<'a, E: Entity> Queryable for SelectQuery<'a, E> {
    type Output = Vec<E>;

    fn filter(&mut self, predicate: Predicate) {
        self.predicate = Some(Predicate::fold_and(self.predicate.take(), predicate));
    }

    fn or_filter(&mut self, predicate: Predicate) {
        self.predicate = Some(Predicate::fold_or(self.predicate.take(), predicate));
    }

    fn limit(&mut self, limit: i64) {
        self.limit = Some(limit);
    }

    fn offset(&mut self, offset: i64) {
        self.offset = Some(offset);
    }

    fn fetch(&self) -> Result<Vec<E>> {
        let (sql, params) = self.to_sql();
        self.db.query(&sql, rusqlite::params_from_iter(params))
    }
}

#[cfg(test)]
mod tests {
    use rusqlite_migration::{Migrations, M};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::criteria::{apply_criteria, Comparison, Criterion, Pagination};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Track {
        id: i64,
        title: String,
        plays: i64,
        deleted: i64,
    }

    fn track_db() -> Result<Db> {
        let db = Db::open_memory()?;
        db.migrate(&Migrations::new(vec![M::up(
            "CREATE TABLE tracks (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                title   TEXT NOT NULL,
                plays   INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );",
        )]))?;
        for (title, plays, deleted) in [
            ("Change", 40, 0),
            ("Digital Bath", 25, 0),
            ("Passenger", 10, 0),
            ("Knife Prty", 5, 1),
            ("Cherry Waves", 60, 0),
        ] {
            db.execute(
                "INSERT INTO tracks (title, plays, deleted) VALUES (?, ?, ?)",
                rusqlite::params![title, plays, deleted],
            )?;
        }
        Ok(db)
    }

    fn titles(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|t| t.title.as_str()).collect()
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn renders_scope_outside_folded_predicate() -> Result<()> {
        let db = Db::open_memory()?;
        let mut query = SelectQuery::<Track>::new(&db, "tracks").scoped("deleted = 0");
        query.filter(Predicate::Compare(Comparison::Eq("plays".to_string(), Value::Integer(1))));
        query.or_filter(Predicate::Compare(Comparison::Eq("plays".to_string(), Value::Integer(2))));
        query.offset(5);

        let (sql, params) = query.to_sql();
        assert_eq!(
            sql,
            "SELECT * FROM tracks WHERE deleted = 0 AND ((plays = ? OR plays = ?)) ORDER BY id LIMIT -1 OFFSET 5"
        );
        assert_eq!(params, vec![Value::Integer(1), Value::Integer(2)]);
        Ok(())
    }

    #[test]
    fn filters_against_rows() -> Result<()> {
        let db = track_db()?;
        let query = apply_criteria(
            SelectQuery::<Track>::new(&db, "tracks"),
            &[Criterion::at_least("plays", 25i64), Criterion::like("title", text("%a%"))],
        )?;
        assert_eq!(titles(&query.fetch()?), vec!["Change", "Digital Bath", "Cherry Waves"]);
        Ok(())
    }

    #[test]
    fn or_widens_within_scope_only() -> Result<()> {
        let db = track_db()?;
        let query = apply_criteria(
            SelectQuery::<Track>::new(&db, "tracks").scoped("deleted = 0"),
            &[
                Criterion::greater_than("plays", 50i64),
                Criterion::less_than("plays", 20i64).or(),
            ],
        )?;
        // "Knife Prty" matches the OR but is outside the scope.
        assert_eq!(titles(&query.fetch()?), vec!["Passenger", "Cherry Waves"]);
        Ok(())
    }

    #[test]
    fn in_and_not_against_rows() -> Result<()> {
        let db = track_db()?;
        let query = apply_criteria(
            SelectQuery::<Track>::new(&db, "tracks"),
            &[
                Criterion::any_of("id", vec![1i64, 2, 3]),
                Criterion::not_equals("title", text("Digital Bath")),
            ],
        )?;
        assert_eq!(titles(&query.fetch()?), vec!["Change", "Passenger"]);
        Ok(())
    }

    #[test]
    fn paginates_in_stable_order() -> Result<()> {
        let db = track_db()?;
        let page = |n: i64| -> Result<Vec<Track>> {
            let criteria = Pagination::new(n, 2).to_criteria();
            apply_criteria(SelectQuery::<Track>::new(&db, "tracks"), &criteria)?.fetch()
        };
        assert_eq!(titles(&page(1)?), vec!["Change", "Digital Bath"]);
        assert_eq!(titles(&page(2)?), vec!["Passenger", "Knife Prty"]);
        assert_eq!(titles(&page(3)?), vec!["Cherry Waves"]);
        assert!(page(4)?.is_empty());
        Ok(())
    }

    #[test]
    fn repeated_fetch_is_identical() -> Result<()> {
        let db = track_db()?;
        let query = apply_criteria(
            SelectQuery::<Track>::new(&db, "tracks").order_by("plays DESC, id"),
            &[Criterion::at_least("plays", 10i64), Criterion::limit(3)],
        )?;
        let first = query.fetch()?;
        let second = query.fetch()?;
        assert_eq!(first, second);
        assert_eq!(titles(&first), vec!["Cherry Waves", "Change", "Digital Bath"]);
        Ok(())
    }

    #[test]
    fn unknown_column_is_an_execution_error() -> Result<()> {
        let db = track_db()?;
        let query = apply_criteria(
            SelectQuery::<Track>::new(&db, "tracks"),
            &[Criterion::equals("missing", 1i64)],
        )?;
        assert!(query.fetch().is_err());
        Ok(())
    }
}
