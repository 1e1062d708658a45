use rusqlite_migration::{Migrations, M};

/// Catalog and history schema. Append new migrations, never edit old ones.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "
            CREATE TABLE products (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                price       INTEGER NOT NULL DEFAULT 0, -- cents, decimal(10,2)
                stock       INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                deleted_at  INTEGER
            );
            CREATE INDEX idx_products_deleted_at ON products (deleted_at);

            CREATE TABLE categories (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                deleted_at  INTEGER
            );
            CREATE INDEX idx_categories_deleted_at ON categories (deleted_at);

            CREATE TABLE product_categories (
                product_id  INTEGER NOT NULL REFERENCES products (id),
                category_id INTEGER NOT NULL REFERENCES categories (id),
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (product_id, category_id)
            );
            ",
        ),
        M::up(
            "
            CREATE TABLE history_records (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid        TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id   INTEGER NOT NULL,
                changed_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_history_records_entity ON history_records (entity_type, entity_id);

            CREATE TABLE history_details (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                history_record_id INTEGER NOT NULL REFERENCES history_records (id),
                field             TEXT NOT NULL,
                old_value         TEXT,
                new_value         TEXT NOT NULL
            );
            CREATE INDEX idx_history_details_record ON history_details (history_record_id);
            ",
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() -> anyhow::Result<()> {
        migrations().validate()?;
        Ok(())
    }
}
