use std::path::Path;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use zerocopy::IntoBytes;

use crate::llm::Price;
use crate::model::{Account, Chat, ChatContent, ContentChunk, ContentEmbedding, EmbeddingType};

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS accounts (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chats (
  id TEXT PRIMARY KEY,
  account_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  cost REAL NOT NULL DEFAULT 0,
  title TEXT NOT NULL DEFAULT '',
  title_customized INTEGER NOT NULL DEFAULT 0,
  title_generated INTEGER NOT NULL DEFAULT 0,
  title_regen_requested INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_account ON chats(account_id);
CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id);

CREATE TABLE IF NOT EXISTS chat_contents (
  chat_id TEXT PRIMARY KEY,
  turns TEXT NOT NULL,
  FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS content (
  id TEXT PRIMARY KEY,
  account_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_content_account ON content(account_id);

CREATE TABLE IF NOT EXISTS content_embeddings (
  content_id TEXT NOT NULL,
  embedding_type TEXT NOT NULL,
  account_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  token_count INTEGER NOT NULL,
  vector BLOB NOT NULL,
  PRIMARY KEY (content_id, embedding_type)
);

CREATE INDEX IF NOT EXISTS idx_content_embeddings_account_type
  ON content_embeddings(account_id, embedding_type);
"#,
        )?;
        conn.execute_batch("PRAGMA user_version = 1;")?;
    }

    Ok(())
}

/// Runs `f` inside a deferred (read) transaction. Rollforward phases use
/// this for their consistent-snapshot reads; no external call may happen
/// inside `f`.
pub fn read_tx<T>(conn: &mut Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

/// Runs `f` inside an immediate (write) transaction; an error rolls back
/// every write made by `f`.
pub fn write_tx<T>(conn: &mut Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

pub fn put_account(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        r#"INSERT INTO accounts (id, name) VALUES (?1, ?2)
           ON CONFLICT(id) DO UPDATE SET name = excluded.name"#,
        params![account.id, account.name],
    )?;
    Ok(())
}

pub fn get_account(conn: &Connection, account_id: &str) -> Result<Option<Account>> {
    Ok(conn
        .query_row(
            r#"SELECT id, name FROM accounts WHERE id = ?1"#,
            params![account_id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn put_chat(conn: &Connection, chat: &Chat) -> Result<()> {
    conn.execute(
        r#"INSERT INTO chats
           (id, account_id, user_id, cost, title, title_customized, title_generated, title_regen_requested, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT(id) DO UPDATE SET
             cost = excluded.cost,
             title = excluded.title,
             title_customized = excluded.title_customized,
             title_generated = excluded.title_generated,
             title_regen_requested = excluded.title_regen_requested"#,
        params![
            chat.id,
            chat.account_id,
            chat.user_id,
            chat.cost.0,
            chat.title,
            chat.title_customized as i64,
            chat.title_generated as i64,
            chat.title_regen_requested as i64,
            chat.created_at_ms,
        ],
    )?;
    Ok(())
}

pub fn get_chat(conn: &Connection, chat_id: &str) -> Result<Option<Chat>> {
    Ok(conn
        .query_row(
            r#"SELECT id, account_id, user_id, cost, title, title_customized, title_generated, title_regen_requested, created_at
               FROM chats WHERE id = ?1"#,
            params![chat_id],
            |row| {
                Ok(Chat {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    user_id: row.get(2)?,
                    cost: Price(row.get(3)?),
                    title: row.get(4)?,
                    title_customized: row.get::<_, i64>(5)? != 0,
                    title_generated: row.get::<_, i64>(6)? != 0,
                    title_regen_requested: row.get::<_, i64>(7)? != 0,
                    created_at_ms: row.get(8)?,
                })
            },
        )
        .optional()?)
}

pub fn put_chat_content(conn: &Connection, cc: &ChatContent) -> Result<()> {
    let turns = serde_json::to_string(&cc.turns)?;
    conn.execute(
        r#"INSERT INTO chat_contents (chat_id, turns) VALUES (?1, ?2)
           ON CONFLICT(chat_id) DO UPDATE SET turns = excluded.turns"#,
        params![cc.chat_id, turns],
    )?;
    Ok(())
}

pub fn get_chat_content(conn: &Connection, chat_id: &str) -> Result<Option<ChatContent>> {
    let turns_json: Option<String> = conn
        .query_row(
            r#"SELECT turns FROM chat_contents WHERE chat_id = ?1"#,
            params![chat_id],
            |row| row.get(0),
        )
        .optional()?;

    match turns_json {
        Some(json) => Ok(Some(ChatContent {
            chat_id: chat_id.to_string(),
            turns: serde_json::from_str(&json)
                .map_err(|e| anyhow!("corrupt chat content {chat_id}: {e}"))?,
        })),
        None => Ok(None),
    }
}

pub fn put_content_chunk(conn: &Connection, chunk: &ContentChunk) -> Result<()> {
    conn.execute(
        r#"INSERT INTO content (id, account_id, item_id, text) VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(id) DO UPDATE SET text = excluded.text"#,
        params![chunk.id, chunk.account_id, chunk.item_id, chunk.text],
    )?;
    Ok(())
}

pub fn get_content_chunk(conn: &Connection, content_id: &str) -> Result<Option<ContentChunk>> {
    Ok(conn
        .query_row(
            r#"SELECT id, account_id, item_id, text FROM content WHERE id = ?1"#,
            params![content_id],
            |row| {
                Ok(ContentChunk {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    item_id: row.get(2)?,
                    text: row.get(3)?,
                })
            },
        )
        .optional()?)
}

/// Writes one (content, type) embedding row. Re-embedding replaces the row
/// wholesale; vectors are never patched in place. Blobs are native-endian
/// f32 and read back on the same host, never exchanged across machines.
pub fn put_content_embedding(conn: &Connection, emb: &ContentEmbedding) -> Result<()> {
    conn.execute(
        r#"INSERT INTO content_embeddings
           (content_id, embedding_type, account_id, item_id, token_count, vector)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(content_id, embedding_type) DO UPDATE SET
             account_id = excluded.account_id,
             item_id = excluded.item_id,
             token_count = excluded.token_count,
             vector = excluded.vector"#,
        params![
            emb.content_id,
            emb.embedding_type.as_str(),
            emb.account_id,
            emb.item_id,
            emb.token_count,
            emb.vector.as_slice().as_bytes(),
        ],
    )?;
    Ok(())
}

/// Secondary-index scan: every embedding of one account at one type.
pub fn list_account_embeddings(
    conn: &Connection,
    account_id: &str,
    embedding_type: EmbeddingType,
) -> Result<Vec<ContentEmbedding>> {
    let mut stmt = conn.prepare(
        r#"SELECT content_id, embedding_type, account_id, item_id, token_count, vector
           FROM content_embeddings
           WHERE account_id = ?1 AND embedding_type = ?2"#,
    )?;

    let mut rows = stmt.query(params![account_id, embedding_type.as_str()])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let type_str: String = row.get(1)?;
        let blob: Vec<u8> = row.get(5)?;
        result.push(ContentEmbedding {
            content_id: row.get(0)?,
            embedding_type: EmbeddingType::parse(&type_str)?,
            account_id: row.get(2)?,
            item_id: row.get(3)?,
            token_count: row.get(4)?,
            vector: vector_from_blob(&blob)?,
        });
    }

    Ok(result)
}

fn vector_from_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(anyhow!("embedding blob has invalid length {}", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
