//! Field-level change capture for tracked entities.
//!
//! Entities declare their fields statically through [`Audited::fields`]; the
//! diff walks that list in declaration order and compares the text form of
//! each value. Comparing text means `1.50` and `1.5` count as different.

use std::any::Any;

use crate::bus::Event;

/// Fields that identify a row or stamp it, never recorded as changes.
pub const UNTRACKED_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "deleted_at"];

/// Total, deterministic text form of a field value as stored in history.
pub trait FieldText {
    fn field_text(&self) -> String;
}

macro_rules! display_field_text {
    ($($t:ty),*) => {
        $(
            impl FieldText for $t {
                fn field_text(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

display_field_text!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize, f32, f64, bool, char, String, str);

impl<T: FieldText> FieldText for Option<T> {
    fn field_text(&self) -> String {
        match self {
            Some(value) => value.field_text(),
            None => "null".to_string(),
        }
    }
}

impl<T: FieldText + ?Sized> FieldText for &T {
    fn field_text(&self) -> String {
        (**self).field_text()
    }
}

/// An entity whose mutations are recorded in history.
pub trait Audited: Clone + Send + Sync + 'static {
    /// Short lowercase name, used as the topic prefix and as `entity_type` in
    /// history rows.
    const KIND: &'static str;

    fn id(&self) -> i64;

    /// Every declared field with its text form, in declaration order,
    /// including the untracked ones.
    fn fields(&self) -> Vec<(&'static str, String)>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: String,
}

/// Changes between two snapshots of an entity. With no old snapshot every
/// tracked field is reported with no old value; otherwise only fields whose
/// text differs are.
pub fn diff<E: Audited>(old: Option<&E>, new: &E) -> Vec<FieldChange> {
    let tracked = |name: &&str| !UNTRACKED_FIELDS.contains(name);
    match old {
        None => new
            .fields()
            .into_iter()
            .filter(|(name, _)| tracked(name))
            .map(|(name, new_value)| FieldChange {
                field: name.to_string(),
                old_value: None,
                new_value,
            })
            .collect(),
        Some(old) => old
            .fields()
            .into_iter()
            .zip(new.fields())
            .filter(|((name, _), _)| tracked(name))
            .filter(|((_, old_value), (_, new_value))| old_value != new_value)
            .map(|((name, old_value), (_, new_value))| FieldChange {
                field: name.to_string(),
                old_value: Some(old_value),
                new_value,
            })
            .collect(),
    }
}

/// Lifecycle of a tracked entity, carrying owned snapshots.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityEvent<E> {
    Created(E),
    Updated { old: E, new: E },
    Deleted(i64),
}

impl<E: Audited> EntityEvent<E> {
    pub fn action(&self) -> &'static str {
        match self {
            EntityEvent::Created(_) => "created",
            EntityEvent::Updated { .. } => "updated",
            EntityEvent::Deleted(_) => "deleted",
        }
    }

    /// `<kind>.created`, `<kind>.updated` and `<kind>.deleted`.
    pub fn topics() -> [String; 3] {
        ["created", "updated", "deleted"].map(|action| format!("{}.{}", E::KIND, action))
    }
}

impl<E: Audited> Event for EntityEvent<E> {
    fn topic(&self) -> String {
        format!("{}.{}", E::KIND, self.action())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
