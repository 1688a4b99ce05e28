//! Persistence of canonical events.
//!
//! A [`PersistenceSink`] stores events per type and owns the experiment and
//! session tables that hand out the ids stamped into every event's prefix.
//!
//! [`TableStore`] writes a directory:
//!
//! ```text
//! <dir>/schema.json            registered schemas keyed by event type id
//! <dir>/<EventClass>.bin       fixed-layout records, one table per type
//! <dir>/experiments.jsonl      one experiment entry per line
//! <dir>/sessions.jsonl         one session entry per line
//! <dir>/condition_variables_<experiment_id>.json   condition table columns
//! <dir>/condition_variables_<experiment_id>.jsonl  one condition row per line
//! ```
//!
//! Reopening a directory continues its experiment and session ids.
//! [`MemoryStore`] keeps the same data in memory.

use crate::constants::EventTypeId;
use crate::error::{ListenerError, StoreError};
use crate::event::{EventRecord, EventSchema};
use crate::eventbus::EventListener;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentInfo {
    pub code: String,
    pub title: String,
    pub description: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub code: String,
    pub name: String,
    pub comments: String,
    pub user_variables: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExperimentEntry {
    experiment_id: u32,
    #[serde(flatten)]
    info: ExperimentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionEntry {
    session_id: u32,
    experiment_id: u32,
    #[serde(flatten)]
    info: SessionInfo,
}

/// Columns of an experiment's condition-variable table.
///
/// Every row starts with `session_id` and `index_id`, followed by one value
/// per user column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTable {
    pub experiment_id: u32,
    pub columns: Vec<String>,
}

const CONDITION_KEYS: [&str; 2] = ["session_id", "index_id"];

impl ConditionTable {
    pub fn new(experiment_id: u32, columns: Vec<String>) -> Result<Self, StoreError> {
        for (i, name) in columns.iter().enumerate() {
            if name.is_empty() || CONDITION_KEYS.contains(&name.as_str()) || columns[..i].contains(name) {
                return Err(StoreError::ConditionTable(format!("invalid column name '{}'", name)));
            }
        }
        Ok(Self { experiment_id, columns })
    }

    /// Build one row from `index_id` followed by the column values.
    pub fn row(&self, session_id: u32, values: &[Value]) -> Result<Value, StoreError> {
        if values.len() != self.columns.len() + 1 {
            return Err(StoreError::ConditionTable(format!(
                "row has {} values, expected index_id and {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        let mut row = Map::new();
        row.insert(CONDITION_KEYS[0].into(), session_id.into());
        row.insert(CONDITION_KEYS[1].into(), values[0].clone());
        for (name, value) in self.columns.iter().zip(&values[1..]) {
            row.insert(name.clone(), value.clone());
        }
        Ok(Value::Object(row))
    }
}

fn no_condition_table() -> StoreError {
    StoreError::ConditionTable("not initialized".into())
}

/// Durable event storage.
pub trait PersistenceSink: Send + Sync {
    fn register_schema(&self, schema: &Arc<EventSchema>) -> Result<(), StoreError>;

    fn append(&self, event: &EventRecord) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;

    /// Id of the experiment with `info.code`, creating it if needed.
    fn create_experiment(&self, info: &ExperimentInfo) -> Result<u32, StoreError>;

    fn create_session(&self, experiment_id: u32, info: &SessionInfo) -> Result<u32, StoreError>;

    fn session_code_exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Make `table` the active condition-variable table.
    fn init_condition_table(&self, table: ConditionTable) -> Result<(), StoreError>;

    /// Append a row to the active condition-variable table.
    fn add_condition_row(&self, session_id: u32, values: &[Value]) -> Result<(), StoreError>;
}

/// Experiment and session tables shared by both stores.
#[derive(Default)]
struct Catalog {
    experiments: Vec<ExperimentEntry>,
    sessions: Vec<SessionEntry>,
}

impl Catalog {
    fn find_experiment(&self, code: &str) -> Option<u32> {
        self.experiments
            .iter()
            .find(|e| e.info.code == code)
            .map(|e| e.experiment_id)
    }

    fn next_experiment(&self, info: &ExperimentInfo) -> ExperimentEntry {
        ExperimentEntry {
            experiment_id: self.experiments.iter().map(|e| e.experiment_id).max().unwrap_or(0) + 1,
            info: info.clone(),
        }
    }

    fn next_session(&self, experiment_id: u32, info: &SessionInfo) -> SessionEntry {
        SessionEntry {
            session_id: self.sessions.iter().map(|s| s.session_id).max().unwrap_or(0) + 1,
            experiment_id,
            info: info.clone(),
        }
    }

    fn session_code_exists(&self, code: &str) -> bool {
        self.sessions.iter().any(|s| s.info.code == code)
    }
}

struct Table {
    schema: Arc<EventSchema>,
    writer: BufWriter<File>,
}

struct TableInner {
    tables: HashMap<EventTypeId, Table>,
    catalog: Catalog,
    conditions: Option<ConditionTable>,
    closed: bool,
}

/// Directory-backed store of fixed-layout event tables.
pub struct TableStore {
    dir: PathBuf,
    inner: Mutex<TableInner>,
}

const SCHEMA_FILE: &str = "schema.json";
const EXPERIMENTS_FILE: &str = "experiments.jsonl";
const SESSIONS_FILE: &str = "sessions.jsonl";

impl TableStore {
    /// Open (creating if needed) the store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let open_err = |source| StoreError::Open {
            path: dir.clone(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(open_err)?;
        let catalog = Catalog {
            experiments: read_jsonl(&dir.join(EXPERIMENTS_FILE)).map_err(|e| as_open(&dir, e))?,
            sessions: read_jsonl(&dir.join(SESSIONS_FILE)).map_err(|e| as_open(&dir, e))?,
        };
        log::info!(
            "data store opened at {} ({} experiments, {} sessions)",
            dir.display(),
            catalog.experiments.len(),
            catalog.sessions.len()
        );
        Ok(Self {
            dir,
            inner: Mutex::new(TableInner {
                tables: HashMap::new(),
                catalog,
                conditions: None,
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, TableInner>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    pub fn table_path(&self, schema: &EventSchema) -> PathBuf {
        self.dir.join(format!("{}.bin", schema.name))
    }

    pub fn condition_path(&self, experiment_id: u32) -> PathBuf {
        self.dir.join(format!("condition_variables_{}.jsonl", experiment_id))
    }

    fn write_schema_file(&self, tables: &HashMap<EventTypeId, Table>) -> Result<(), StoreError> {
        let all: BTreeMap<u8, &EventSchema> = tables.iter().map(|(t, tbl)| (t.0, tbl.schema.as_ref())).collect();
        let text = serde_json::to_string_pretty(&all)?;
        std::fs::write(self.dir.join(SCHEMA_FILE), text)?;
        Ok(())
    }

    /// Read back every record of one table.
    pub fn read_table(dir: impl AsRef<Path>, schema: Arc<EventSchema>) -> Result<Vec<EventRecord>, StoreError> {
        let path = dir.as_ref().join(format!("{}.bin", schema.name));
        let mut bytes = Vec::new();
        match File::open(&path) {
            Ok(mut f) => {
                f.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        if bytes.len() % schema.record_size != 0 {
            return Err(StoreError::Layout(crate::error::RecordError::new(
                schema.type_id.0,
                format!("table length {} is not a multiple of {}", bytes.len(), schema.record_size),
            )));
        }
        bytes
            .chunks(schema.record_size)
            .map(|chunk| EventRecord::decode_fixed(schema.clone(), chunk).map_err(StoreError::from))
            .collect()
    }
}

fn as_open(dir: &Path, e: StoreError) -> StoreError {
    match e {
        StoreError::Io(source) => StoreError::Open {
            path: dir.to_path_buf(),
            source,
        },
        other => other,
    }
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

fn append_jsonl<T: Serialize>(path: &Path, entry: &T) -> Result<(), StoreError> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    f.write_all(line.as_bytes())?;
    Ok(())
}

impl PersistenceSink for TableStore {
    fn register_schema(&self, schema: &Arc<EventSchema>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.tables.contains_key(&schema.type_id) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(schema))?;
        inner.tables.insert(
            schema.type_id,
            Table {
                schema: schema.clone(),
                writer: BufWriter::new(file),
            },
        );
        self.write_schema_file(&inner.tables)?;
        log::debug!("table registered for {}", schema.name);
        Ok(())
    }

    fn append(&self, event: &EventRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let table = inner
            .tables
            .get_mut(&event.event_type)
            .ok_or(StoreError::UnknownSchema(event.event_type.0))?;
        let bytes = event.encode_fixed();
        if bytes.len() != table.schema.record_size {
            return Err(StoreError::Layout(crate::error::RecordError::new(
                event.event_type.0,
                format!("encoded {} bytes, table expects {}", bytes.len(), table.schema.record_size),
            )));
        }
        table.writer.write_all(&bytes)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for table in inner.tables.values_mut() {
            table.writer.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Ok(());
        }
        for table in inner.tables.values_mut() {
            table.writer.flush()?;
        }
        inner.tables.clear();
        inner.closed = true;
        log::info!("data store at {} closed", self.dir.display());
        Ok(())
    }

    fn create_experiment(&self, info: &ExperimentInfo) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        if let Some(id) = inner.catalog.find_experiment(&info.code) {
            return Ok(id);
        }
        let entry = inner.catalog.next_experiment(info);
        append_jsonl(&self.dir.join(EXPERIMENTS_FILE), &entry)?;
        let id = entry.experiment_id;
        inner.catalog.experiments.push(entry);
        Ok(id)
    }

    fn create_session(&self, experiment_id: u32, info: &SessionInfo) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        let entry = inner.catalog.next_session(experiment_id, info);
        append_jsonl(&self.dir.join(SESSIONS_FILE), &entry)?;
        let id = entry.session_id;
        inner.catalog.sessions.push(entry);
        Ok(id)
    }

    fn session_code_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.catalog.session_code_exists(code))
    }

    fn init_condition_table(&self, table: ConditionTable) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let columns_path = self
            .dir
            .join(format!("condition_variables_{}.json", table.experiment_id));
        std::fs::write(columns_path, serde_json::to_string_pretty(&table)?)?;
        log::debug!(
            "condition table for experiment {}: {:?}",
            table.experiment_id,
            table.columns
        );
        inner.conditions = Some(table);
        Ok(())
    }

    fn add_condition_row(&self, session_id: u32, values: &[Value]) -> Result<(), StoreError> {
        let inner = self.lock()?;
        let table = inner.conditions.as_ref().ok_or_else(no_condition_table)?;
        append_jsonl(&self.condition_path(table.experiment_id), &table.row(session_id, values)?)
    }
}

#[derive(Default)]
struct MemoryInner {
    schemas: HashMap<EventTypeId, Arc<EventSchema>>,
    events: Vec<EventRecord>,
    catalog: Catalog,
    conditions: Option<ConditionTable>,
    condition_rows: Vec<Value>,
    closed: bool,
}

/// In-memory store with the same semantics as [`TableStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    /// Stored events of one type, in append order.
    pub fn events(&self, event_type: EventTypeId) -> Vec<EventRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).events.len()
    }

    pub fn condition_rows(&self) -> Vec<Value> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).condition_rows.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceSink for MemoryStore {
    fn register_schema(&self, schema: &Arc<EventSchema>) -> Result<(), StoreError> {
        self.lock()?.schemas.entry(schema.type_id).or_insert_with(|| schema.clone());
        Ok(())
    }

    fn append(&self, event: &EventRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.schemas.contains_key(&event.event_type) {
            return Err(StoreError::UnknownSchema(event.event_type.0));
        }
        inner.events.push(event.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        Ok(())
    }

    fn create_experiment(&self, info: &ExperimentInfo) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        if let Some(id) = inner.catalog.find_experiment(&info.code) {
            return Ok(id);
        }
        let entry = inner.catalog.next_experiment(info);
        let id = entry.experiment_id;
        inner.catalog.experiments.push(entry);
        Ok(id)
    }

    fn create_session(&self, experiment_id: u32, info: &SessionInfo) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        let entry = inner.catalog.next_session(experiment_id, info);
        let id = entry.session_id;
        inner.catalog.sessions.push(entry);
        Ok(id)
    }

    fn session_code_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.catalog.session_code_exists(code))
    }

    fn init_condition_table(&self, table: ConditionTable) -> Result<(), StoreError> {
        self.lock()?.conditions = Some(table);
        Ok(())
    }

    fn add_condition_row(&self, session_id: u32, values: &[Value]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner
            .conditions
            .as_ref()
            .ok_or_else(no_condition_table)?
            .row(session_id, values)?;
        inner.condition_rows.push(row);
        Ok(())
    }
}

/// Listener that appends each event to a [`PersistenceSink`].
pub struct PersistenceListener {
    sink: Arc<dyn PersistenceSink>,
}

impl PersistenceListener {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }
}

impl EventListener for PersistenceListener {
    fn name(&self) -> &str {
        "data-store"
    }

    fn handle(&self, event: &EventRecord) -> Result<(), ListenerError> {
        self.sink
            .append(event)
            .map_err(|e| ListenerError::new(self.name(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::event_type;
    use crate::event::{fields, FieldType, FieldValue};
    use serde_json::json;

    fn schema() -> Arc<EventSchema> {
        Arc::new(EventSchema::compose(
            event_type::MESSAGE,
            "MessageEvent",
            fields(&[("text", FieldType::Str(8))]),
        ))
    }

    #[test]
    fn memory_store_requires_schema() {
        let store = MemoryStore::new();
        let ev = EventRecord::new(schema(), vec![FieldValue::Text("x".into())]).unwrap();
        assert!(matches!(store.append(&ev), Err(StoreError::UnknownSchema(151))));
        store.register_schema(&schema()).unwrap();
        store.append(&ev).unwrap();
        assert_eq!(store.events(event_type::MESSAGE).len(), 1);
        store.close().unwrap();
        assert!(matches!(store.append(&ev), Err(StoreError::Closed)));
    }

    #[test]
    fn experiment_codes_are_reused() {
        let store = MemoryStore::new();
        let info = ExperimentInfo {
            code: "STROOP".into(),
            ..Default::default()
        };
        let a = store.create_experiment(&info).unwrap();
        let b = store.create_experiment(&info).unwrap();
        assert_eq!(a, b);
        let s = store
            .create_session(a, &SessionInfo { code: "S1".into(), ..Default::default() })
            .unwrap();
        assert_eq!(s, 1);
        assert!(store.session_code_exists("S1").unwrap());
        assert!(!store.session_code_exists("S2").unwrap());
    }

    #[test]
    fn condition_rows_follow_the_active_table() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.add_condition_row(1, &[json!(0)]),
            Err(StoreError::ConditionTable(_))
        ));
        assert!(ConditionTable::new(1, vec!["index_id".into()]).is_err());
        assert!(ConditionTable::new(1, vec!["a".into(), "a".into()]).is_err());

        let table = ConditionTable::new(1, vec!["word".into(), "colour".into()]).unwrap();
        store.init_condition_table(table).unwrap();
        store.add_condition_row(3, &[json!(0), json!("RED"), json!("blue")]).unwrap();
        assert!(store.add_condition_row(3, &[json!(1), json!("RED")]).is_err());
        assert_eq!(
            store.condition_rows(),
            vec![json!({ "session_id": 3, "index_id": 0, "word": "RED", "colour": "blue" })]
        );
    }
}
