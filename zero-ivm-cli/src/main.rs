//! Development and demonstration harness for `zero-ivm`.
//!
//! Loads a JSON fixture of rows per table, materializes one query built
//! from command-line flags, and prints the resulting view as JSON. With
//! `--changes <file>`, replays a JSON script of row changes afterward and
//! prints the view again after each one. Grounded in the teacher's
//! `pgtrickle-relay`/`pgtrickle-tui` binaries' shape (a `clap` + `tracing`
//! CLI loading an optional TOML config) with the `ratatui` terminal UI
//! dropped — this harness only ever prints one-shot JSON, it has no
//! interactive screen to draw.

use clap::Parser;
use serde::Deserialize;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use zero_ivm::ast::SimpleOp;
use zero_ivm::config::EngineConfig;
use zero_ivm::error::ZeroError;
use zero_ivm::ivm::builder::BuilderDelegate;
use zero_ivm::lifecycle::{QueryLifecycleManager, Ttl};
use zero_ivm::query::Query;
use zero_ivm::row::{PrimaryKey, Row, SortDir};
use zero_ivm::source::{Source, SourceChange, SourceSchema};
use zero_ivm::storage::{MemStorage, Storage};
use zero_ivm::value::Value;
use zero_ivm::view::View;

#[derive(Parser)]
#[command(name = "zero-ivm-cli", about = "Demonstration harness for the zero-ivm incremental query engine")]
struct Cli {
    /// JSON fixture: `{"table": [{"col": value, ...}, ...], ...}`.
    #[arg(long)]
    fixture: PathBuf,

    /// Table the query runs against.
    #[arg(long)]
    table: String,

    /// Primary key column name, applied uniformly to every table in the
    /// fixture (this harness has no schema file — see DESIGN.md).
    #[arg(long, default_value = "id")]
    pk: String,

    /// `field=value` equality filter; repeat for multiple (ANDed).
    /// `value` is parsed as JSON when possible, else kept as a string.
    #[arg(long = "filter", value_name = "FIELD=VALUE")]
    filters: Vec<String>,

    /// `field` or `field:desc` (default `:asc`); repeat to build a
    /// composite ordering in the order given.
    #[arg(long = "order-by", value_name = "FIELD[:asc|desc]")]
    order_by: Vec<String>,

    #[arg(long)]
    limit: Option<u32>,

    /// Shorthand for `--limit 1` plus singular projection.
    #[arg(long)]
    one: bool,

    /// Optional JSON array of change operations to replay after the
    /// initial view is printed: `[{"table":"issue","op":"add","row":{...}}]`.
    #[arg(long)]
    changes: Option<PathBuf>,

    /// Optional TOML file overriding `EngineConfig` defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChangeOp {
    Add,
    Remove,
    Edit,
    Set,
}

#[derive(Deserialize)]
struct ChangeEntry {
    table: String,
    op: ChangeOp,
    row: Option<Row>,
    old_row: Option<Row>,
}

impl ChangeEntry {
    fn into_source_change(self) -> Result<SourceChange, String> {
        let row = self.row.ok_or_else(|| format!("change on '{}' missing 'row'", self.table))?;
        Ok(match self.op {
            ChangeOp::Add => SourceChange::Add { row },
            ChangeOp::Remove => SourceChange::Remove { row },
            ChangeOp::Set => SourceChange::Set { row },
            ChangeOp::Edit => {
                let old_row = self
                    .old_row
                    .ok_or_else(|| format!("edit on '{}' missing 'old_row'", self.table))?;
                SourceChange::Edit { row, old_row }
            }
        })
    }
}

struct CliDelegate {
    sources: RefCell<BTreeMap<String, Source>>,
}

impl CliDelegate {
    fn new() -> Self {
        CliDelegate { sources: RefCell::new(BTreeMap::new()) }
    }

    fn source(&self, table: &str) -> Option<Source> {
        self.sources.borrow().get(table).cloned()
    }

    fn load_fixture(&self, fixture: BTreeMap<String, Vec<Row>>, pk_column: &str) {
        for (table, rows) in fixture {
            let mut columns: Vec<String> = Vec::new();
            for row in &rows {
                for col in row.keys() {
                    if !columns.contains(col) {
                        columns.push(col.clone());
                    }
                }
            }
            let schema = SourceSchema {
                table: table.clone(),
                columns,
                primary_key: PrimaryKey::new(vec![pk_column.to_string()]),
            };
            let source = Source::new(schema);
            for row in rows {
                source.push(SourceChange::Add { row }).expect("fixture rows must have unique primary keys");
            }
            self.sources.borrow_mut().insert(table, source);
        }
    }
}

impl BuilderDelegate for CliDelegate {
    fn get_source(&self, _schema: Option<&str>, table: &str) -> Result<Source, ZeroError> {
        self.source(table).ok_or_else(|| ZeroError::UnknownTable(table.to_string()))
    }

    fn create_storage(&self) -> Box<dyn Storage> {
        Box::new(MemStorage::new())
    }
}

fn parse_filter_value(raw: &str) -> Value {
    serde_json::from_str::<Json>(raw)
        .ok()
        .and_then(|j| serde_json::from_value::<Value>(j).ok())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn build_query(cli: &Cli) -> Result<Query, String> {
    let mut query = Query::new(cli.table.clone());
    for filter in &cli.filters {
        let (field, raw_value) = filter
            .split_once('=')
            .ok_or_else(|| format!("filter '{filter}' is not of the form FIELD=VALUE"))?;
        query = query.filter(field, SimpleOp::Eq, parse_filter_value(raw_value));
    }
    for component in &cli.order_by {
        let (field, dir) = match component.split_once(':') {
            Some((field, "desc")) => (field, SortDir::Desc),
            Some((field, "asc")) => (field, SortDir::Asc),
            Some((_, other)) => return Err(format!("unknown order direction '{other}'")),
            None => (component.as_str(), SortDir::Asc),
        };
        query = query.order_by(field, dir);
    }
    if cli.one {
        query = query.one();
    } else if let Some(limit) = cli.limit {
        query = query.limit(limit);
    }
    Ok(query)
}

fn row_to_json(row: &Row) -> Json {
    Json::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(Json::Null)))
            .collect(),
    )
}

fn view_to_json(view: &View) -> Json {
    match view {
        View::Single(entry) => match entry {
            Some(e) => entry_to_json(e),
            None => Json::Null,
        },
        View::Many(entries) => Json::Array(entries.iter().map(entry_to_json).collect()),
    }
}

fn entry_to_json(entry: &Rc<zero_ivm::view::Entry>) -> Json {
    let mut obj = match row_to_json(&entry.row) {
        Json::Object(map) => map,
        _ => unreachable!("row_to_json always returns an object"),
    };
    for (name, child) in &entry.relationships {
        obj.insert(name.clone(), view_to_json(child));
    }
    Json::Object(obj)
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, String> {
    match path {
        None => Ok(EngineConfig::local_only()),
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
            toml::from_str(&text).map_err(|e| format!("parsing {}: {e}", path.display()))
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let fixture_text =
        std::fs::read_to_string(&cli.fixture).map_err(|e| format!("reading {}: {e}", cli.fixture.display()))?;
    let fixture: BTreeMap<String, Vec<Row>> =
        serde_json::from_str(&fixture_text).map_err(|e| format!("parsing fixture: {e}"))?;

    let delegate = CliDelegate::new();
    delegate.load_fixture(fixture, &cli.pk);

    let config = load_config(cli.config.as_ref())?;
    let manager = QueryLifecycleManager::new(config);
    let query = build_query(&cli)?;

    let materialized = manager.materialize(&query, Ttl::Forever, &delegate).map_err(|e| e.to_string())?;
    println!("{}", serde_json::to_string_pretty(&view_to_json(&materialized.view.data())).unwrap());

    if let Some(changes_path) = &cli.changes {
        let text = std::fs::read_to_string(changes_path)
            .map_err(|e| format!("reading {}: {e}", changes_path.display()))?;
        let entries: Vec<ChangeEntry> = serde_json::from_str(&text).map_err(|e| format!("parsing changes: {e}"))?;
        for entry in entries {
            let table = entry.table.clone();
            let source = delegate.source(&table).ok_or_else(|| format!("unknown table '{table}' in change script"))?;
            let change = entry.into_source_change()?;
            source.push(change).map_err(|e| format!("pushing change to '{table}': {e}"))?;
            println!("{}", serde_json::to_string_pretty(&view_to_json(&materialized.view.data())).unwrap());
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::try_init().ok();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
