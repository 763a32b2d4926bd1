#![forbid(unsafe_code)]

//! Durable per-task persistence. Every mutation commits before returning,
//! so an interrupted run resumes at `find_undone` with nothing lost and
//! nothing re-spent. Single-writer, process-local.

use pb_core::book::{
    AnalysisRecord, AnalysisResponse, InputTask, Role, TaskRecord, TaskResponse, TranslationPair,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    Json(serde_json::Error),
    UnknownRole(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Json(err) => write!(f, "json: {err}"),
            Self::UnknownRole(role) => write!(f, "unknown role: {role}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

fn parse_role(role: &str) -> Result<Role, StoreError> {
    Role::parse(role).ok_or_else(|| StoreError::UnknownRole(role.to_string()))
}

/// Translation pipeline store: one row per flattened task.
#[derive(Debug)]
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS tasks (
              idx INTEGER PRIMARY KEY,
              role TEXT NOT NULL,
              source_text TEXT NOT NULL,
              response TEXT
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Drop and reinsert every row; all responses become NULL.
    pub fn initialize(&mut self, tasks: &[InputTask]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tasks", [])?;
        for (i, task) in tasks.iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks (idx, role, source_text) VALUES (?1, ?2, ?3)",
                params![i as i64, task.role.as_str(), task.source_text],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self, index: i64) -> Result<Option<TaskRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT idx, role, source_text, response FROM tasks WHERE idx = ?1",
                params![index],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((index, role, source_text, response)) = row else {
            return Ok(None);
        };
        let response = match response {
            Some(json) => Some(serde_json::from_str::<TaskResponse>(&json)?),
            None => None,
        };
        Ok(Some(TaskRecord {
            index,
            role: parse_role(&role)?,
            source_text,
            response,
        }))
    }

    /// Rewrite one row's identity and clear its response.
    pub fn reset_task(&self, index: i64, role: Role, source_text: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tasks SET role = ?1, source_text = ?2, response = NULL WHERE idx = ?3",
            params![role.as_str(), source_text, index],
        )?;
        Ok(())
    }

    pub fn set_response(&self, index: i64, response: &TaskResponse) -> Result<(), StoreError> {
        let json = serde_json::to_string(response)?;
        self.conn.execute(
            "UPDATE tasks SET response = ?1 WHERE idx = ?2",
            params![json, index],
        )?;
        Ok(())
    }

    /// Smallest index with a NULL response, or -1 when all are done.
    pub fn find_undone(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT idx FROM tasks WHERE response IS NULL ORDER BY idx ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(-1))
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }

    pub fn load_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, role, source_text, response FROM tasks ORDER BY idx ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (index, role, source_text, response) = row?;
            let response = match response {
                Some(json) => Some(serde_json::from_str::<TaskResponse>(&json)?),
                None => None,
            };
            tasks.push(TaskRecord {
                index,
                role: parse_role(&role)?,
                source_text,
                response,
            });
        }
        Ok(tasks)
    }
}

/// Analysis pipeline store: one row per token-bounded pair batch.
#[derive(Debug)]
pub struct AnalysisStore {
    conn: Connection,
}

impl AnalysisStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS tasks (
              idx INTEGER PRIMARY KEY,
              request TEXT NOT NULL,
              response TEXT
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn initialize(&mut self, requests: &[Vec<TranslationPair>]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tasks", [])?;
        for (i, request) in requests.iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks (idx, request) VALUES (?1, ?2)",
                params![i as i64, serde_json::to_string(request)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self, index: i64) -> Result<Option<AnalysisRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT idx, request, response FROM tasks WHERE idx = ?1",
                params![index],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((index, request, response)) = row else {
            return Ok(None);
        };
        Ok(Some(Self::decode(index, &request, response.as_deref())?))
    }

    fn decode(
        index: i64,
        request: &str,
        response: Option<&str>,
    ) -> Result<AnalysisRecord, StoreError> {
        let request: Vec<TranslationPair> = serde_json::from_str(request)?;
        let response = match response {
            Some(json) => Some(serde_json::from_str::<AnalysisResponse>(json)?),
            None => None,
        };
        Ok(AnalysisRecord {
            index,
            request,
            response,
        })
    }

    pub fn reset_task(&self, index: i64, request: &[TranslationPair]) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tasks SET request = ?1, response = NULL WHERE idx = ?2",
            params![serde_json::to_string(request)?, index],
        )?;
        Ok(())
    }

    pub fn set_response(&self, index: i64, response: &AnalysisResponse) -> Result<(), StoreError> {
        let json = serde_json::to_string(response)?;
        self.conn.execute(
            "UPDATE tasks SET response = ?1 WHERE idx = ?2",
            params![json, index],
        )?;
        Ok(())
    }

    pub fn find_undone(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT idx FROM tasks WHERE response IS NULL ORDER BY idx ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(-1))
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }

    pub fn load_all(&self) -> Result<Vec<AnalysisRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT idx, request, response FROM tasks ORDER BY idx ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (index, request, response) = row?;
            tasks.push(Self::decode(index, &request, response.as_deref())?);
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_core::book::ResponseContent;
    use serde_json::json;

    fn seed_tasks() -> Vec<InputTask> {
        vec![
            InputTask::new(Role::BookTitle, "A Tale"),
            InputTask::new(Role::Paragraph, "He loved linguistics."),
            InputTask::new(Role::Paragraph, "It gave him wisdom."),
        ]
    }

    fn pair_response(source: &str, target: &str) -> TaskResponse {
        TaskResponse {
            content: ResponseContent::Pairs(vec![TranslationPair::new(source, target)]),
            hint: Some("scene".to_string()),
            cost: 0.002,
            error: false,
            intact: false,
        }
    }

    #[test]
    fn initialize_seeds_dense_indices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::open(dir.path().join("state.db")).expect("open");
        store.initialize(&seed_tasks()).expect("initialize");
        assert_eq!(store.count().expect("count"), 3);
        assert_eq!(store.find_undone().expect("undone"), 0);
        let record = store.load(1).expect("load").expect("record");
        assert_eq!(record.role, Role::Paragraph);
        assert_eq!(record.source_text, "He loved linguistics.");
        assert!(record.response.is_none());
        assert!(store.load(99).expect("load").is_none());
    }

    #[test]
    fn responses_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.db");
        {
            let mut store = TaskStore::open(&path).expect("open");
            store.initialize(&seed_tasks()).expect("initialize");
            store
                .set_response(0, &pair_response("A Tale", "ある物語"))
                .expect("set");
        }
        let store = TaskStore::open(&path).expect("reopen");
        assert_eq!(store.count().expect("count"), 3);
        assert_eq!(store.find_undone().expect("undone"), 1);
        let record = store.load(0).expect("load").expect("record");
        let response = record.response.expect("response");
        assert_eq!(response.hint.as_deref(), Some("scene"));
        assert_eq!(response.cost, 0.002);
    }

    #[test]
    fn find_undone_advances_in_index_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::open(dir.path().join("state.db")).expect("open");
        store.initialize(&seed_tasks()).expect("initialize");
        store
            .set_response(1, &pair_response("He loved linguistics.", "訳"))
            .expect("set");
        assert_eq!(store.find_undone().expect("undone"), 0);
        store
            .set_response(0, &pair_response("A Tale", "ある物語"))
            .expect("set");
        assert_eq!(store.find_undone().expect("undone"), 2);
        store
            .set_response(2, &pair_response("It gave him wisdom.", "訳"))
            .expect("set");
        assert_eq!(store.find_undone().expect("undone"), -1);
    }

    #[test]
    fn reset_task_clears_only_one_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::open(dir.path().join("state.db")).expect("open");
        store.initialize(&seed_tasks()).expect("initialize");
        for (i, task) in seed_tasks().iter().enumerate() {
            store
                .set_response(i as i64, &pair_response(&task.source_text, "訳"))
                .expect("set");
        }
        store
            .reset_task(1, Role::Paragraph, "He loved linguistics.")
            .expect("reset");
        assert_eq!(store.find_undone().expect("undone"), 1);
        let untouched = store.load(2).expect("load").expect("record");
        assert!(untouched.response.is_some());
    }

    #[test]
    fn set_response_ignores_unknown_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::open(dir.path().join("state.db")).expect("open");
        store.initialize(&seed_tasks()).expect("initialize");
        store
            .set_response(42, &pair_response("ghost", "幽霊"))
            .expect("set");
        assert_eq!(store.count().expect("count"), 3);
        assert!(store.load(42).expect("load").is_none());
    }

    #[test]
    fn initialize_discards_previous_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::open(dir.path().join("state.db")).expect("open");
        store.initialize(&seed_tasks()).expect("initialize");
        store
            .set_response(0, &pair_response("A Tale", "ある物語"))
            .expect("set");
        store
            .initialize(&seed_tasks()[..2])
            .expect("reinitialize");
        assert_eq!(store.count().expect("count"), 2);
        assert_eq!(store.find_undone().expect("undone"), 0);
    }

    #[test]
    fn stored_response_json_is_compact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::open(dir.path().join("state.db")).expect("open");
        store.initialize(&seed_tasks()).expect("initialize");
        store
            .set_response(0, &pair_response("A Tale", "ある物語"))
            .expect("set");
        let raw: String = store
            .conn
            .query_row("SELECT response FROM tasks WHERE idx = 0", [], |row| {
                row.get(0)
            })
            .expect("raw");
        assert_eq!(
            raw,
            r#"{"content":[{"source":"A Tale","target":"ある物語"}],"hint":"scene","cost":0.002}"#
        );
    }

    #[test]
    fn analysis_store_round_trips_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = AnalysisStore::open(dir.path().join("state-analyze.db")).expect("open");
        let requests = vec![
            vec![TranslationPair::new("He ran.", "彼は走った。")],
            vec![
                TranslationPair::new("One.", "一。"),
                TranslationPair::new("Two.", "二。"),
            ],
        ];
        store.initialize(&requests).expect("initialize");
        assert_eq!(store.count().expect("count"), 2);
        let record = store.load(1).expect("load").expect("record");
        assert_eq!(record.request.len(), 2);
        assert!(record.response.is_none());

        store
            .set_response(
                1,
                &AnalysisResponse {
                    content: json!([[], []]),
                    cost: 0.01,
                },
            )
            .expect("set");
        assert_eq!(store.find_undone().expect("undone"), 0);
        let all = store.load_all().expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].response.as_ref().expect("response").cost, 0.01);

        store.reset_task(1, &requests[1]).expect("reset");
        assert_eq!(store.find_undone().expect("undone"), 0);
        assert!(store.load(1).expect("load").expect("record").response.is_none());
    }
}
