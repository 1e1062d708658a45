//! Products and categories, their services, and the wiring that connects
//! writes to the history recorder.

use anyhow::Result;

use crate::bus::EventBus;
use crate::config::Config;
use crate::db::{schema, Db, HistoryRecorder, HistoryRepository};

pub use category::{Category, CategoryPatch, CategoryQuery, CategoryRepository, CategoryService, NewCategory};
pub use product::{NewProduct, Price, Product, ProductPatch, ProductQuery, ProductRepository, ProductService};

pub mod category;
pub mod product;

/// The assembled catalog: one database, one bus, and history recorders for
/// every audited kind already subscribed.
#[derive(Clone)]
pub struct Catalog {
    db: Db,
    bus: EventBus,
    products: ProductService,
    categories: CategoryService,
    history: HistoryRepository,
}

impl Catalog {
    pub fn open(config: &Config) -> Result<Self> {
        let db = match &config.database_path {
            Some(path) => Db::open_with(path, config.pool_size, config.busy_timeout())?,
            None => Db::open_memory()?,
        };
        db.migrate(&schema::migrations())?;

        let bus = EventBus::new(config.bus_workers)?;
        HistoryRecorder::<Product>::subscribe(&bus, db.clone());
        HistoryRecorder::<Category>::subscribe(&bus, db.clone());

        log::info!(
            "Catalog opened on {} with {} bus worker(s)",
            config
                .database_path
                .as_ref()
                .map_or_else(|| ":memory:".to_string(), |path| path.display().to_string()),
            config.bus_workers.max(1)
        );
        Ok(Self {
            products: ProductService::new(ProductRepository::new(db.clone()), bus.clone()),
            categories: CategoryService::new(CategoryRepository::new(db.clone()), bus.clone()),
            history: HistoryRepository::new(db.clone()),
            db,
            bus,
        })
    }

    pub fn products(&self) -> &ProductService {
        &self.products
    }

    pub fn categories(&self) -> &CategoryService {
        &self.categories
    }

    pub fn history(&self) -> &HistoryRepository {
        &self.history
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}
