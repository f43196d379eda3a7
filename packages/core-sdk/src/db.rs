use anyhow::{bail, Result};
use rusqlite::{
    params, params_from_iter, types::Type, Connection, ErrorCode, OptionalExtension, ToSql,
};
use std::{path::Path, thread, time::Duration};
use time::OffsetDateTime;

use crate::models::{ReviewRecord, VocabularyItem, VocabularyUpdate};

const VOCABULARY_COLUMNS: &str = "id, word, timestamp, archived, detail, review_count";

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vocabulary (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            word TEXT NOT NULL UNIQUE,
            timestamp INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            vocabulary_ids TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;

    // 旧库按版本陆续增加的列
    ensure_column(conn, "vocabulary", "detail", "TEXT")?;
    ensure_column(conn, "vocabulary", "review_count", "INTEGER NOT NULL DEFAULT 0")?;

    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        CREATE INDEX IF NOT EXISTS idx_vocabulary_timestamp ON vocabulary(timestamp);
        CREATE INDEX IF NOT EXISTS idx_vocabulary_review_count ON vocabulary(review_count);
        CREATE INDEX IF NOT EXISTS idx_reviews_timestamp ON reviews(timestamp);
        "#,
        )
    })?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                [],
            )
        })?;
    }
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 列出全部设置项（name, value）。
 */
pub fn list_credentials(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT name, value FROM credentials ORDER BY id ASC")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 写入设置项，已存在则覆盖。
 */
pub fn upsert_credential(conn: &Connection, name: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO credentials (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value=excluded.value",
            params![name, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 新增生词，返回主键。
 */
pub fn insert_vocabulary(conn: &Connection, word: &str, timestamp: OffsetDateTime) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO vocabulary (word, timestamp, archived, review_count) VALUES (?1, ?2, 0, 0)",
            params![word, to_millis(timestamp)],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 按主键部分更新生词。
 */
pub fn update_vocabulary(conn: &Connection, id: i64, update: &VocabularyUpdate) -> Result<()> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(timestamp) = update.timestamp {
        sets.push("timestamp=?");
        values.push(Box::new(to_millis(timestamp)));
    }
    if let Some(archived) = update.archived {
        sets.push("archived=?");
        values.push(Box::new(archived));
    }
    if let Some(detail) = &update.detail {
        sets.push("detail=?");
        values.push(Box::new(detail.clone()));
    }
    if let Some(review_count) = update.review_count {
        sets.push("review_count=?");
        values.push(Box::new(review_count));
    }
    if sets.is_empty() {
        return Ok(());
    }
    values.push(Box::new(id));

    let sql = format!("UPDATE vocabulary SET {} WHERE id=?", sets.join(", "));
    let rows = retry_on_locked(|| conn.execute(&sql, params_from_iter(values.iter())))?;
    if rows == 0 {
        bail!("vocabulary id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 删除生词。
 */
pub fn delete_vocabulary(conn: &Connection, id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM vocabulary WHERE id=?1", params![id]))?;
    Ok(())
}

/**
 * \brief 列出全部生词（按主键升序）。
 */
pub fn list_vocabulary(conn: &Connection) -> Result<Vec<VocabularyItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM vocabulary ORDER BY id ASC",
        VOCABULARY_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_vocabulary)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按单词精确查找。
 */
pub fn find_vocabulary_by_word(conn: &Connection, word: &str) -> Result<Option<VocabularyItem>> {
    conn.query_row(
        &format!("SELECT {} FROM vocabulary WHERE word=?1", VOCABULARY_COLUMNS),
        params![word],
        map_vocabulary,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 按主键获取生词。
 */
pub fn get_vocabulary(conn: &Connection, id: i64) -> Result<Option<VocabularyItem>> {
    conn.query_row(
        &format!("SELECT {} FROM vocabulary WHERE id=?1", VOCABULARY_COLUMNS),
        params![id],
        map_vocabulary,
    )
    .optional()
    .map_err(Into::into)
}

fn map_vocabulary(row: &rusqlite::Row<'_>) -> rusqlite::Result<VocabularyItem> {
    Ok(VocabularyItem {
        id: row.get(0)?,
        word: row.get(1)?,
        timestamp: from_millis(2, row.get(2)?)?,
        archived: row.get(3)?,
        detail: row.get(4)?,
        review_count: row.get::<_, Option<u32>>(5)?.unwrap_or(0),
    })
}

/**
 * \brief 保存一次复习练习，并把涉及生词的复习次数各加一（单事务）。
 * \details 任一生词不存在时整体回滚，既不留下练习记录也不改动复习次数。
 */
pub fn insert_review(
    conn: &Connection,
    content: &str,
    timestamp: OffsetDateTime,
    vocabulary_ids: &[i64],
) -> Result<i64> {
    let ids = serde_json::to_string(vocabulary_ids)?;
    let tx = conn.unchecked_transaction()?;
    retry_on_locked(|| {
        tx.execute(
            "INSERT INTO reviews (content, timestamp, vocabulary_ids) VALUES (?1, ?2, ?3)",
            params![content, to_millis(timestamp), ids],
        )
    })?;
    let review_id = tx.last_insert_rowid();
    for id in vocabulary_ids {
        let rows = retry_on_locked(|| {
            tx.execute(
                "UPDATE vocabulary SET review_count = review_count + 1 WHERE id=?1",
                params![id],
            )
        })?;
        if rows == 0 {
            bail!("vocabulary id {} not found", id);
        }
    }
    tx.commit()?;
    Ok(review_id)
}

/**
 * \brief 读取最近一次复习练习。
 */
pub fn latest_review(conn: &Connection) -> Result<Option<ReviewRecord>> {
    conn.query_row(
        "SELECT id, content, timestamp, vocabulary_ids FROM reviews ORDER BY timestamp DESC, id DESC LIMIT 1",
        [],
        map_review,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出全部复习练习（最新在前）。
 */
pub fn list_reviews(conn: &Connection) -> Result<Vec<ReviewRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, content, timestamp, vocabulary_ids FROM reviews ORDER BY timestamp DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([], map_review)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn map_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewRecord> {
    let ids: String = row.get(3)?;
    let vocabulary_ids = serde_json::from_str(&ids)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(ReviewRecord {
        id: row.get(0)?,
        content: row.get(1)?,
        timestamp: from_millis(2, row.get(2)?)?,
        vocabulary_ids,
    })
}

fn to_millis(timestamp: OffsetDateTime) -> i64 {
    (timestamp.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(column: usize, millis: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e)))
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::timestamp_now;

    pub(crate) fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_migrate_is_idempotent_and_upgrades_old_schema() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE vocabulary (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                word TEXT NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0
            );
            INSERT INTO vocabulary (word, timestamp) VALUES ('legacy', 0);",
        )
        .expect("old schema");
        migrate(&conn).expect("migrate old");
        migrate(&conn).expect("migrate again");

        let item = find_vocabulary_by_word(&conn, "legacy")
            .expect("find")
            .expect("exists");
        assert_eq!(item.review_count, 0);
        assert_eq!(item.detail, None);
    }

    #[test]
    fn test_credentials_upsert() {
        let conn = mem_conn();
        upsert_credential(&conn, "openai_api_key", "sk-1").expect("insert");
        upsert_credential(&conn, "openai_model", "gpt-4o").expect("insert");
        upsert_credential(&conn, "openai_api_key", "sk-2").expect("update");
        let creds = list_credentials(&conn).expect("list");
        assert_eq!(
            creds,
            vec![
                ("openai_api_key".to_string(), "sk-2".to_string()),
                ("openai_model".to_string(), "gpt-4o".to_string()),
            ]
        );
    }

    #[test]
    fn test_vocabulary_crud_and_partial_update() {
        let conn = mem_conn();
        let ts = timestamp_now();
        let id = insert_vocabulary(&conn, "serendipity", ts).expect("insert");

        let item = get_vocabulary(&conn, id).expect("get").expect("exists");
        assert_eq!(item.word, "serendipity");
        assert_eq!(item.timestamp, ts);
        assert!(!item.archived);

        update_vocabulary(
            &conn,
            id,
            &VocabularyUpdate {
                detail: Some("a happy accident".to_string()),
                ..Default::default()
            },
        )
        .expect("update detail");
        let item = get_vocabulary(&conn, id).expect("get").expect("exists");
        assert_eq!(item.detail.as_deref(), Some("a happy accident"));
        assert_eq!(item.timestamp, ts);

        update_vocabulary(&conn, id, &VocabularyUpdate::default()).expect("noop update");
        assert!(update_vocabulary(
            &conn,
            id + 100,
            &VocabularyUpdate {
                archived: Some(true),
                ..Default::default()
            }
        )
        .is_err());

        delete_vocabulary(&conn, id).expect("delete");
        assert!(list_vocabulary(&conn).expect("list").is_empty());
    }

    #[test]
    fn test_word_is_unique() {
        let conn = mem_conn();
        insert_vocabulary(&conn, "apple", timestamp_now()).expect("insert");
        assert!(insert_vocabulary(&conn, "apple", timestamp_now()).is_err());
    }

    #[test]
    fn test_insert_review_increments_counts() {
        let conn = mem_conn();
        let a = insert_vocabulary(&conn, "a", timestamp_now()).expect("insert a");
        let b = insert_vocabulary(&conn, "b", timestamp_now()).expect("insert b");
        insert_review(&conn, "first", timestamp_now(), &[a, b]).expect("review");
        insert_review(&conn, "second", timestamp_now(), &[a]).expect("review");
        assert_eq!(get_vocabulary(&conn, a).unwrap().unwrap().review_count, 2);
        assert_eq!(get_vocabulary(&conn, b).unwrap().unwrap().review_count, 1);
    }

    #[test]
    fn test_insert_review_with_missing_word_rolls_back() {
        let conn = mem_conn();
        let a = insert_vocabulary(&conn, "a", timestamp_now()).expect("insert a");
        let b = insert_vocabulary(&conn, "b", timestamp_now()).expect("insert b");
        delete_vocabulary(&conn, b).expect("delete b");

        assert!(insert_review(&conn, "orphan", timestamp_now(), &[a, b]).is_err());
        assert_eq!(get_vocabulary(&conn, a).unwrap().unwrap().review_count, 0);
        assert!(latest_review(&conn).expect("latest").is_none());
        assert!(list_reviews(&conn).expect("list").is_empty());
    }

    #[test]
    fn test_reviews_latest_first() {
        let conn = mem_conn();
        assert!(latest_review(&conn).expect("latest").is_none());
        let ids: Vec<i64> = ["x", "y", "z"]
            .into_iter()
            .map(|word| insert_vocabulary(&conn, word, timestamp_now()).expect("insert"))
            .collect();
        let first = timestamp_now();
        let later = first + time::Duration::seconds(5);
        insert_review(&conn, "older", first, &ids[..2]).expect("insert");
        let id = insert_review(&conn, "newer", later, &ids[2..]).expect("insert");

        let latest = latest_review(&conn).expect("latest").expect("exists");
        assert_eq!(latest.id, id);
        assert_eq!(latest.content, "newer");
        assert_eq!(latest.vocabulary_ids, ids[2..].to_vec());
        assert_eq!(latest.timestamp, later);

        let all = list_reviews(&conn).expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].vocabulary_ids, ids[..2].to_vec());
    }

    #[test]
    fn test_telemetry_flag_roundtrip() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).expect("get"));
        set_telemetry_enabled(&conn, true).expect("set");
        assert!(get_telemetry_enabled(&conn).expect("get"));
    }
}
