use std::{marker::PhantomData, sync::Arc};

use anyhow::Result;
use serde::Deserialize;
use uuid::Uuid;

use super::core::{execute, now_millis, query_rows, Db};
use super::query::SelectQuery;
use super::types::{HistoryDetail, HistoryRecord};
use crate::audit::{diff, Audited, EntityEvent, FieldChange};
use crate::bus::{Event, EventBus, Listener};
use crate::criteria::{apply_criteria, Criterion, Pagination, Queryable};

/// Reads and writes the `history_records` / `history_details` pair.
#[derive(Clone)]
pub struct HistoryRepository {
    db: Db,
}

impl HistoryRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Inserts the parent row. A fresh v7 UUID is generated when none is
    /// given.
    pub fn insert_record(&self, entity_type: &str, entity_id: i64, uuid: Option<String>) -> Result<HistoryRecord> {
        let uuid = uuid.unwrap_or_else(|| Uuid::now_v7().to_string());
        let changed_at = now_millis()?;
        let conn = self.db.connection()?;
        execute(
            &conn,
            "INSERT INTO history_records (uuid, entity_type, entity_id, changed_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![uuid, entity_type, entity_id, changed_at],
        )?;
        Ok(HistoryRecord {
            id: conn.last_insert_rowid(),
            uuid,
            entity_type: entity_type.to_string(),
            entity_id,
            changed_at,
            details: Vec::new(),
        })
    }

    pub fn insert_detail(&self, history_record_id: i64, change: &FieldChange) -> Result<HistoryDetail> {
        let conn = self.db.connection()?;
        execute(
            &conn,
            "INSERT INTO history_details (history_record_id, field, old_value, new_value) VALUES (?, ?, ?, ?)",
            rusqlite::params![history_record_id, change.field, change.old_value, change.new_value],
        )?;
        Ok(HistoryDetail {
            id: conn.last_insert_rowid(),
            history_record_id,
            field: change.field.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
        })
    }

    /// Records matching the criteria, each with its details loaded.
    pub fn find_all(&self, criteria: &[Criterion]) -> Result<Vec<HistoryRecord>> {
        let query = apply_criteria(SelectQuery::<HistoryRecord>::new(&self.db, "history_records"), criteria)?;
        let mut records = query.fetch()?;
        for record in records.iter_mut() {
            record.details = self.details_for(record.id)?;
        }
        Ok(records)
    }

    pub fn details_for(&self, history_record_id: i64) -> Result<Vec<HistoryDetail>> {
        let conn = self.db.connection()?;
        query_rows(
            &conn,
            "SELECT * FROM history_details WHERE history_record_id = ? ORDER BY id",
            [history_record_id],
        )
    }
}

/// Filter parameters for browsing history.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct HistoryQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub page: i64,
    pub limit: i64,
}

impl HistoryQuery {
    pub fn to_criteria(&self) -> Vec<Criterion> {
        let mut criteria = Vec::new();
        if let Some(entity_type) = &self.entity_type {
            criteria.push(Criterion::equals("entity_type", entity_type.clone()));
        }
        if let Some(entity_id) = self.entity_id {
            criteria.push(Criterion::equals("entity_id", entity_id));
        }
        criteria.extend(Pagination::new(self.page, self.limit).to_criteria());
        criteria
    }
}

/// Listener that turns `EntityEvent<E>` into history rows.
///
/// Created events record every tracked field with no old value; updated
/// events record only the fields whose text changed, keyed to the new
/// snapshot's id; deleted events are ignored. Detail inserts are best effort:
/// a failing one is logged and the rest are still written.
pub struct HistoryRecorder<E> {
    history: HistoryRepository,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Audited> HistoryRecorder<E> {
    pub fn new(db: Db) -> Self {
        Self {
            history: HistoryRepository::new(db),
            _kind: PhantomData,
        }
    }

    /// Subscribes one recorder to the created, updated and deleted topics of
    /// `E`.
    pub fn subscribe(bus: &EventBus, db: Db) {
        let recorder: Arc<dyn Listener> = Arc::new(Self::new(db));
        for topic in EntityEvent::<E>::topics() {
            bus.subscribe_shared(&topic, recorder.clone());
        }
    }

    pub fn record(&self, entity_id: i64, changes: &[FieldChange]) -> Result<HistoryRecord> {
        let mut record = self.history.insert_record(E::KIND, entity_id, None)?;
        for change in changes {
            match self.history.insert_detail(record.id, change) {
                Ok(detail) => record.details.push(detail),
                Err(e) => log::error!(
                    "Failed to record change of '{}' for {} {} in history {}: {:#}",
                    change.field,
                    E::KIND,
                    entity_id,
                    record.uuid,
                    e
                ),
            }
        }
        log::debug!(
            "Recorded {} change(s) for {} {} as {}",
            record.details.len(),
            E::KIND,
            entity_id,
            record.uuid
        );
        Ok(record)
    }
}

impl<E: Audited> Listener for HistoryRecorder<E> {
    fn handle(&self, event: &dyn Event) -> Result<()> {
        let Some(event) = event.as_any().downcast_ref::<EntityEvent<E>>() else {
            log::trace!("History recorder for {} ignoring '{}'", E::KIND, event.topic());
            return Ok(());
        };
        match event {
            EntityEvent::Created(entity) => {
                self.record(entity.id(), &diff(None, entity))?;
            }
            EntityEvent::Updated { old, new } => {
                self.record(new.id(), &diff(Some(old), new))?;
            }
            EntityEvent::Deleted(id) => log::trace!("No history for deleted {} {}", E::KIND, id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::audit::FieldText;
    use crate::db::schema;

    #[derive(Clone, Debug, PartialEq)]
    struct Lamp {
        id: i64,
        name: String,
        watts: i64,
        created_at: i64,
    }

    impl Audited for Lamp {
        const KIND: &'static str = "lamp";

        fn id(&self) -> i64 {
            self.id
        }

        fn fields(&self) -> Vec<(&'static str, String)> {
            vec![
                ("id", self.id.field_text()),
                ("name", self.name.field_text()),
                ("watts", self.watts.field_text()),
                ("created_at", self.created_at.field_text()),
            ]
        }
    }

    struct Unrelated;

    impl Event for Unrelated {
        fn topic(&self) -> String {
            "lamp.created".to_string()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn history_db() -> Result<Db> {
        let db = Db::open_memory()?;
        db.migrate(&schema::migrations())?;
        Ok(db)
    }

    fn lamp(watts: i64) -> Lamp {
        Lamp {
            id: 3,
            name: "Desk".to_string(),
            watts,
            created_at: 1,
        }
    }

    #[test]
    fn created_records_every_tracked_field() -> Result<()> {
        let db = history_db()?;
        let recorder = HistoryRecorder::<Lamp>::new(db.clone());
        recorder.handle(&EntityEvent::Created(lamp(40)))?;

        let records = HistoryRepository::new(db).find_all(&[])?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_type, "lamp");
        assert_eq!(records[0].entity_id, 3);
        assert!(Uuid::parse_str(&records[0].uuid).is_ok());
        let details: Vec<_> = records[0]
            .details
            .iter()
            .map(|d| (d.field.as_str(), d.old_value.as_deref(), d.new_value.as_str()))
            .collect();
        assert_eq!(details, vec![("name", None, "Desk"), ("watts", None, "40")]);
        Ok(())
    }

    #[test]
    fn updated_records_only_changed_fields() -> Result<()> {
        let db = history_db()?;
        let recorder = HistoryRecorder::<Lamp>::new(db.clone());
        recorder.handle(&EntityEvent::Updated {
            old: lamp(40),
            new: lamp(60),
        })?;

        let records = HistoryRepository::new(db).find_all(&[])?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].details.len(), 1);
        let detail = &records[0].details[0];
        assert_eq!(detail.field, "watts");
        assert_eq!(detail.old_value.as_deref(), Some("40"));
        assert_eq!(detail.new_value, "60");
        Ok(())
    }

    #[test]
    fn unchanged_update_still_records_parent() -> Result<()> {
        let db = history_db()?;
        let recorder = HistoryRecorder::<Lamp>::new(db.clone());
        recorder.handle(&EntityEvent::Updated {
            old: lamp(40),
            new: lamp(40),
        })?;

        let records = HistoryRepository::new(db).find_all(&[])?;
        assert_eq!(records.len(), 1);
        assert!(records[0].details.is_empty());
        Ok(())
    }

    #[test]
    fn deleted_and_foreign_events_write_nothing() -> Result<()> {
        let db = history_db()?;
        let recorder = HistoryRecorder::<Lamp>::new(db.clone());
        recorder.handle(&EntityEvent::<Lamp>::Deleted(3))?;
        recorder.handle(&Unrelated)?;
        assert!(HistoryRepository::new(db).find_all(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_details_leave_partial_history() -> Result<()> {
        let db = history_db()?;
        db.execute("DROP TABLE history_details", [])?;
        let recorder = HistoryRecorder::<Lamp>::new(db.clone());
        recorder.handle(&EntityEvent::Created(lamp(40)))?;

        let records: Vec<HistoryRecord> = db.query("SELECT * FROM history_records", [])?;
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_record_is_an_error() -> Result<()> {
        let db = history_db()?;
        db.execute("DROP TABLE history_details", [])?;
        db.execute("DROP TABLE history_records", [])?;
        let recorder = HistoryRecorder::<Lamp>::new(db);
        assert!(recorder.handle(&EntityEvent::Created(lamp(40))).is_err());
        Ok(())
    }

    #[test]
    fn subscribes_one_recorder_to_each_topic() -> Result<()> {
        let db = history_db()?;
        let bus = EventBus::new(1)?;
        HistoryRecorder::<Lamp>::subscribe(&bus, db);
        assert_eq!(bus.listener_count("lamp.created"), 1);
        assert_eq!(bus.listener_count("lamp.updated"), 1);
        assert_eq!(bus.listener_count("lamp.deleted"), 1);
        Ok(())
    }

    #[test]
    fn keeps_a_supplied_uuid() -> Result<()> {
        let db = history_db()?;
        let history = HistoryRepository::new(db);
        let record = history.insert_record("lamp", 1, Some("fixed-uuid".to_string()))?;
        assert_eq!(record.uuid, "fixed-uuid");
        assert!(history.insert_record("lamp", 2, Some("fixed-uuid".to_string())).is_err());
        Ok(())
    }

    #[test]
    fn history_query_filters_and_pages() -> Result<()> {
        let db = history_db()?;
        let history = HistoryRepository::new(db);
        for entity_id in [1, 2, 1, 1] {
            history.insert_record("lamp", entity_id, None)?;
        }
        history.insert_record("chair", 1, None)?;

        let query = HistoryQuery {
            entity_type: Some("lamp".to_string()),
            entity_id: Some(1),
            page: 2,
            limit: 2,
        };
        let records = history.find_all(&query.to_criteria())?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 4);

        let all_lamps = history.find_all(&HistoryQuery {
            entity_type: Some("lamp".to_string()),
            ..Default::default()
        }
        .to_criteria())?;
        assert_eq!(all_lamps.len(), 4);
        Ok(())
    }
}
