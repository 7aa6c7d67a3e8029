//! Shared fixtures for the scenario/property integration tests, the way
//! the teacher's `tests/e2e_*` suite factors shared Postgres container
//! setup into one helper module per scenario file.

use std::cell::RefCell;
use std::collections::BTreeMap;

use zero_ivm::error::ZeroError;
use zero_ivm::ivm::builder::BuilderDelegate;
use zero_ivm::row::{PrimaryKey, Row};
use zero_ivm::source::{Source, SourceSchema};
use zero_ivm::storage::{MemStorage, Storage};
use zero_ivm::value::Value;

pub struct TestDelegate {
    sources: RefCell<BTreeMap<String, Source>>,
}

impl TestDelegate {
    pub fn new() -> Self {
        TestDelegate { sources: RefCell::new(BTreeMap::new()) }
    }

    pub fn register(&self, source: Source) {
        self.sources.borrow_mut().insert(source.schema().table.clone(), source);
    }

    pub fn get(&self, table: &str) -> Source {
        self.sources.borrow().get(table).cloned().unwrap_or_else(|| panic!("no source for '{table}'"))
    }
}

impl BuilderDelegate for TestDelegate {
    fn get_source(&self, _schema: Option<&str>, table: &str) -> Result<Source, ZeroError> {
        self.sources
            .borrow()
            .get(table)
            .cloned()
            .ok_or_else(|| ZeroError::UnknownTable(table.to_string()))
    }

    fn create_storage(&self) -> Box<dyn Storage> {
        Box::new(MemStorage::new())
    }
}

pub fn issue_schema() -> SourceSchema {
    SourceSchema {
        table: "issue".into(),
        columns: vec!["id".into(), "title".into(), "closed".into(), "ownerId".into()],
        primary_key: PrimaryKey::new(vec!["id".into()]),
    }
}

pub fn user_schema() -> SourceSchema {
    SourceSchema {
        table: "user".into(),
        columns: vec!["id".into(), "name".into()],
        primary_key: PrimaryKey::new(vec!["id".into()]),
    }
}

pub fn issue_row(id: &str, title: &str, closed: bool, owner_id: &str) -> Row {
    let mut r = Row::new();
    r.insert("id".into(), Value::String(id.into()));
    r.insert("title".into(), Value::String(title.into()));
    r.insert("closed".into(), Value::Bool(closed));
    r.insert("ownerId".into(), Value::String(owner_id.into()));
    r
}

pub fn user_row(id: &str, name: &str) -> Row {
    let mut r = Row::new();
    r.insert("id".into(), Value::String(id.into()));
    r.insert("name".into(), Value::String(name.into()));
    r
}
