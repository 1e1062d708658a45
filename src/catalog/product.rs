use std::{fmt, str::FromStr};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{
    types::{ToSqlOutput, Value},
    Connection, ToSql,
};
use serde::{Deserialize, Serialize};

use super::category::Category;
use crate::audit::{Audited, EntityEvent, FieldText};
use crate::bus::EventBus;
use crate::criteria::{apply_criteria, Criterion, Pagination, Queryable};
use crate::db::core::{execute, exists, query_rows};
use crate::db::{now_millis, Db, SelectQuery};

/// A `decimal(10,2)` amount held as integer cents. Displays with exactly two
/// decimals, so the history text of `12.5` is `12.50`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Price(i64);

impl Price {
    pub const fn from_cents(cents: i64) -> Self {
        Price(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Parses `12`, `12.5` or `-0.05`. More than two decimals is an error
    /// rather than a rounding.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || frac.len() > 2 || !all_digits(whole) || !all_digits(frac) {
            bail!("invalid price '{}'", text);
        }

        let whole: i64 = whole.parse().with_context(|| format!("invalid price '{}'", text))?;
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>()? * 10,
            _ => frac.parse()?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|cents| cents.checked_add(frac))
            .ok_or_else(|| anyhow!("price '{}' out of range", text))?;
        Ok(Price(if negative { -cents } else { cents }))
    }
}

impl FromStr for Price {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Price::parse(s)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let cents = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, cents / 100, cents % 100)
    }
}

impl FieldText for Price {
    fn field_text(&self) -> String {
        self.to_string()
    }
}

impl From<Price> for Value {
    fn from(price: Price) -> Self {
        Value::Integer(price.0)
    }
}

impl ToSql for Price {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: Price,
    pub stock: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Audited for Product {
    const KIND: &'static str = "product";

    fn id(&self) -> i64 {
        self.id
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.field_text()),
            ("name", self.name.field_text()),
            ("description", self.description.field_text()),
            ("price", self.price.field_text()),
            ("stock", self.stock.field_text()),
            ("created_at", self.created_at.field_text()),
            ("updated_at", self.updated_at.field_text()),
            ("deleted_at", self.deleted_at.field_text()),
        ]
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NewProduct {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: Price,
    #[serde(default)]
    pub stock: i64,
}

/// Partial update; `None` leaves the field as it is.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Price>,
    pub stock: Option<i64>,
}

impl ProductPatch {
    pub fn apply(&self, product: &mut Product) {
        if let Some(name) = &self.name {
            product.name = name.clone();
        }
        if let Some(description) = &self.description {
            product.description = description.clone();
        }
        if let Some(price) = self.price {
            product.price = price;
        }
        if let Some(stock) = self.stock {
            product.stock = stock;
        }
    }
}

/// Search parameters for listing products. Text filters match anywhere in
/// the column; a stock of zero or less means no stock filter.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProductQuery {
    pub page: i64,
    pub limit: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_from: Option<Price>,
    pub price_to: Option<Price>,
    pub stock: i64,
}

impl ProductQuery {
    pub fn to_criteria(&self) -> Vec<Criterion> {
        let mut criteria = Vec::new();
        if let Some(name) = self.name.as_deref().filter(|s| !s.is_empty()) {
            criteria.push(Criterion::like("name", format!("%{}%", name)));
        }
        if let Some(description) = self.description.as_deref().filter(|s| !s.is_empty()) {
            criteria.push(Criterion::like("description", format!("%{}%", description)));
        }
        if let Some(price_from) = self.price_from {
            criteria.push(Criterion::at_least("price", price_from));
        }
        if let Some(price_to) = self.price_to {
            criteria.push(Criterion::at_most("price", price_to));
        }
        if self.stock > 0 {
            criteria.push(Criterion::at_least("stock", self.stock));
        }
        criteria.extend(Pagination::new(self.page, self.limit).to_criteria());
        criteria
    }
}

const LIVE: &str = "deleted_at IS NULL";

#[derive(Clone)]
pub struct ProductRepository {
    db: Db,
}

impl ProductRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create(&self, new: &NewProduct) -> Result<Product> {
        let now = now_millis()?;
        let conn = self.db.connection()?;
        execute(
            &conn,
            "INSERT INTO products (name, description, price, stock, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            rusqlite::params![new.name, new.description, new.price, new.stock, now, now],
        )?;
        Ok(Product {
            id: conn.last_insert_rowid(),
            name: new.name.clone(),
            description: new.description.clone(),
            price: new.price,
            stock: new.stock,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Live products matching the criteria, in id order.
    pub fn find_all(&self, criteria: &[Criterion]) -> Result<Vec<Product>> {
        let products = apply_criteria(SelectQuery::<Product>::new(&self.db, "products").scoped(LIVE), criteria)
            .map_err(anyhow::Error::from)
            .and_then(|query| query.fetch());
        products.map_err(|e| {
            log::error!("Error fetching products: {:#}", e);
            e.context("failed to fetch products")
        })
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Product>> {
        let products: Vec<Product> = self
            .db
            .query("SELECT * FROM products WHERE id = ? AND deleted_at IS NULL", [id])?;
        Ok(products.into_iter().next())
    }

    /// Writes the mutable columns and stamps `updated_at`. Fails if the
    /// product does not exist or was deleted.
    pub fn update(&self, product: &Product) -> Result<Product> {
        let conn = self.db.connection()?;
        write_update(&conn, product)
    }

    /// Reads the live product, applies `change` and writes it back inside one
    /// write transaction. Returns the `(old, new)` snapshots; `old` is exactly
    /// the row the update replaced.
    pub fn modify<F>(&self, id: i64, change: F) -> Result<(Product, Product)>
    where
        F: FnOnce(&mut Product),
    {
        self.db.write_transaction(|txn| {
            let old = query_rows::<Product, _>(
                txn,
                "SELECT * FROM products WHERE id = ? AND deleted_at IS NULL",
                [id],
            )?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("product {} not found", id))?;
            let mut changed = old.clone();
            change(&mut changed);
            let new = write_update(
                txn,
                &Product {
                    id: old.id,
                    created_at: old.created_at,
                    deleted_at: old.deleted_at,
                    ..changed
                },
            )?;
            Ok((old, new))
        })
    }

    /// Soft delete. Returns false if there was no live product to delete.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let now = now_millis()?;
        let affected = self.db.execute(
            "UPDATE products SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            rusqlite::params![now, now, id],
        )?;
        Ok(affected > 0)
    }

    /// Replaces the product's categories. Every category must exist; on any
    /// failure the previous set is kept.
    pub fn set_categories(&self, product_id: i64, category_ids: &[i64]) -> Result<()> {
        let now = now_millis()?;
        self.db.transaction(|txn| {
            if !exists(
                txn,
                "SELECT EXISTS(SELECT 1 FROM products WHERE id = ? AND deleted_at IS NULL)",
                [product_id],
            )? {
                bail!("product {} not found", product_id);
            }
            execute(txn, "DELETE FROM product_categories WHERE product_id = ?", [product_id])?;
            for category_id in category_ids {
                if !exists(
                    txn,
                    "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ? AND deleted_at IS NULL)",
                    [category_id],
                )? {
                    bail!("category {} not found", category_id);
                }
                execute(
                    txn,
                    "INSERT OR IGNORE INTO product_categories (product_id, category_id, created_at) VALUES (?, ?, ?)",
                    rusqlite::params![product_id, category_id, now],
                )?;
            }
            Ok(())
        })
    }

    pub fn categories_for(&self, product_id: i64) -> Result<Vec<Category>> {
        let conn = self.db.connection()?;
        query_rows(
            &conn,
            "SELECT c.* FROM categories c
             JOIN product_categories pc ON pc.category_id = c.id
             WHERE pc.product_id = ? AND c.deleted_at IS NULL
             ORDER BY c.id",
            [product_id],
        )
    }
}

fn write_update(conn: &Connection, product: &Product) -> Result<Product> {
    let now = now_millis()?;
    let affected = execute(
        conn,
        "UPDATE products SET name = ?, description = ?, price = ?, stock = ?, updated_at = ?
         WHERE id = ? AND deleted_at IS NULL",
        rusqlite::params![product.name, product.description, product.price, product.stock, now, product.id],
    )?;
    if affected == 0 {
        bail!("product {} not found", product.id);
    }
    Ok(Product {
        updated_at: now,
        ..product.clone()
    })
}

/// Product writes that announce themselves on the bus. Events go out only
/// after the write succeeded and never change its result.
#[derive(Clone)]
pub struct ProductService {
    repo: ProductRepository,
    bus: EventBus,
}

impl ProductService {
    pub fn new(repo: ProductRepository, bus: EventBus) -> Self {
        Self { repo, bus }
    }

    pub fn create(&self, new: &NewProduct) -> Result<Product> {
        let product = self.repo.create(new)?;
        self.bus.publish(EntityEvent::Created(product.clone()));
        Ok(product)
    }

    /// Replaces the mutable fields of the product with `product.id`.
    pub fn update(&self, product: &Product) -> Result<Product> {
        let (old, new) = self.repo.modify(product.id, |current| {
            current.name = product.name.clone();
            current.description = product.description.clone();
            current.price = product.price;
            current.stock = product.stock;
        })?;
        self.bus.publish(EntityEvent::Updated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn patch(&self, id: i64, patch: &ProductPatch) -> Result<Product> {
        let (old, new) = self.repo.modify(id, |current| patch.apply(current))?;
        self.bus.publish(EntityEvent::Updated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        if !self.repo.delete(id)? {
            bail!("product {} not found", id);
        }
        self.bus.publish(EntityEvent::<Product>::Deleted(id));
        Ok(())
    }

    pub fn find_all(&self, query: &ProductQuery) -> Result<Vec<Product>> {
        self.repo.find_all(&query.to_criteria())
    }

    pub fn find_by_criteria(&self, criteria: &[Criterion]) -> Result<Vec<Product>> {
        self.repo.find_all(criteria)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Product>> {
        self.repo.find_by_id(id)
    }

    pub fn set_categories(&self, product_id: i64, category_ids: &[i64]) -> Result<()> {
        self.repo.set_categories(product_id, category_ids)
    }

    pub fn categories_for(&self, product_id: i64) -> Result<Vec<Category>> {
        self.repo.categories_for(product_id)
    }
}
