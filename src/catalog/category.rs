use anyhow::{anyhow, bail, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::audit::{Audited, EntityEvent, FieldText};
use crate::bus::EventBus;
use crate::criteria::{apply_criteria, Criterion, Pagination, Queryable};
use crate::db::core::{execute, query_rows};
use crate::db::{now_millis, Db, SelectQuery};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Audited for Category {
    const KIND: &'static str = "category";

    fn id(&self) -> i64 {
        self.id
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.field_text()),
            ("name", self.name.field_text()),
            ("description", self.description.field_text()),
            ("created_at", self.created_at.field_text()),
            ("updated_at", self.updated_at.field_text()),
            ("deleted_at", self.deleted_at.field_text()),
        ]
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NewCategory {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl CategoryPatch {
    pub fn apply(&self, category: &mut Category) {
        if let Some(name) = &self.name {
            category.name = name.clone();
        }
        if let Some(description) = &self.description {
            category.description = description.clone();
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CategoryQuery {
    pub page: i64,
    pub limit: i64,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl CategoryQuery {
    pub fn to_criteria(&self) -> Vec<Criterion> {
        let mut criteria = Vec::new();
        if let Some(name) = self.name.as_deref().filter(|s| !s.is_empty()) {
            criteria.push(Criterion::like("name", format!("%{}%", name)));
        }
        if let Some(description) = self.description.as_deref().filter(|s| !s.is_empty()) {
            criteria.push(Criterion::like("description", format!("%{}%", description)));
        }
        criteria.extend(Pagination::new(self.page, self.limit).to_criteria());
        criteria
    }
}

#[derive(Clone)]
pub struct CategoryRepository {
    db: Db,
}

impl CategoryRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create(&self, new: &NewCategory) -> Result<Category> {
        let now = now_millis()?;
        let conn = self.db.connection()?;
        execute(
            &conn,
            "INSERT INTO categories (name, description, created_at, updated_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![new.name, new.description, now, now],
        )?;
        Ok(Category {
            id: conn.last_insert_rowid(),
            name: new.name.clone(),
            description: new.description.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn find_all(&self, criteria: &[Criterion]) -> Result<Vec<Category>> {
        let categories = apply_criteria(
            SelectQuery::<Category>::new(&self.db, "categories").scoped("deleted_at IS NULL"),
            criteria,
        )
        .map_err(anyhow::Error::from)
        .and_then(|query| query.fetch());
        categories.map_err(|e| {
            log::error!("Error fetching categories: {:#}", e);
            e.context("failed to fetch categories")
        })
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Category>> {
        let categories: Vec<Category> = self
            .db
            .query("SELECT * FROM categories WHERE id = ? AND deleted_at IS NULL", [id])?;
        Ok(categories.into_iter().next())
    }

    pub fn update(&self, category: &Category) -> Result<Category> {
        let conn = self.db.connection()?;
        write_update(&conn, category)
    }

    /// Read, change and write back in one write transaction, returning the
    /// `(old, new)` snapshots.
    pub fn modify<F>(&self, id: i64, change: F) -> Result<(Category, Category)>
    where
        F: FnOnce(&mut Category),
    {
        self.db.write_transaction(|txn| {
            let old = query_rows::<Category, _>(
                txn,
                "SELECT * FROM categories WHERE id = ? AND deleted_at IS NULL",
                [id],
            )?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("category {} not found", id))?;
            let mut changed = old.clone();
            change(&mut changed);
            let new = write_update(
                txn,
                &Category {
                    id: old.id,
                    created_at: old.created_at,
                    deleted_at: old.deleted_at,
                    ..changed
                },
            )?;
            Ok((old, new))
        })
    }

    /// Soft delete. Links from products stay but are no longer listed.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let now = now_millis()?;
        let affected = self.db.execute(
            "UPDATE categories SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            rusqlite::params![now, now, id],
        )?;
        Ok(affected > 0)
    }
}

fn write_update(conn: &Connection, category: &Category) -> Result<Category> {
    let now = now_millis()?;
    let affected = execute(
        conn,
        "UPDATE categories SET name = ?, description = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        rusqlite::params![category.name, category.description, now, category.id],
    )?;
    if affected == 0 {
        bail!("category {} not found", category.id);
    }
    Ok(Category {
        updated_at: now,
        ..category.clone()
    })
}

#[derive(Clone)]
pub struct CategoryService {
    repo: CategoryRepository,
    bus: EventBus,
}

impl CategoryService {
    pub fn new(repo: CategoryRepository, bus: EventBus) -> Self {
        Self { repo, bus }
    }

    pub fn create(&self, new: &NewCategory) -> Result<Category> {
        let category = self.repo.create(new)?;
        self.bus.publish(EntityEvent::Created(category.clone()));
        Ok(category)
    }

    pub fn update(&self, category: &Category) -> Result<Category> {
        let (old, new) = self.repo.modify(category.id, |current| {
            current.name = category.name.clone();
            current.description = category.description.clone();
        })?;
        self.bus.publish(EntityEvent::Updated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn patch(&self, id: i64, patch: &CategoryPatch) -> Result<Category> {
        let (old, new) = self.repo.modify(id, |current| patch.apply(current))?;
        self.bus.publish(EntityEvent::Updated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        if !self.repo.delete(id)? {
            bail!("category {} not found", id);
        }
        self.bus.publish(EntityEvent::<Category>::Deleted(id));
        Ok(())
    }

    pub fn find_all(&self, query: &CategoryQuery) -> Result<Vec<Category>> {
        self.repo.find_all(&query.to_criteria())
    }

    pub fn find_by_criteria(&self, criteria: &[Criterion]) -> Result<Vec<Category>> {
        self.repo.find_all(criteria)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Category>> {
        self.repo.find_by_id(id)
    }
}
