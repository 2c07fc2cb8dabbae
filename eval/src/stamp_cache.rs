//! SQLite-backed cache mapping a source tree (by metadata stamps) to
//! the store path of its previous import. A hit only short-circuits the
//! re-import when every stamp matches and the object is still present;
//! correctness always comes from content addressing, the cache is an
//! optimization.

use std::cmp::Ordering;
use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS source_imports (
    id INTEGER PRIMARY KEY,
    root TEXT NOT NULL COLLATE PATH,
    store_path TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS source_imports_by_root ON source_imports(root);
CREATE TABLE IF NOT EXISTS source_stamps (
    import_id INTEGER NOT NULL REFERENCES source_imports(id) ON DELETE CASCADE,
    path TEXT NOT NULL COLLATE PATH,
    mode INTEGER NOT NULL,
    size INTEGER NOT NULL,
    stamp TEXT NOT NULL,
    PRIMARY KEY (import_id, path)
);
";

/// One filesystem entry of a walked source tree.
///
/// The stamp string is `link:<target>` for symlinks, `dir` for
/// directories, and `<seconds>.<micros>-<size>-<inode>-<mode>-<uid>-<gid>`
/// for regular files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StampEntry {
    /// `/`-separated path relative to the import root; empty for the
    /// root itself.
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub stamp: String,
}

pub(crate) struct StampCache {
    conn: Connection,
}

impl StampCache {
    pub fn open(path: &Path) -> rusqlite::Result<StampCache> {
        Self::configure(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<StampCache> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> rusqlite::Result<StampCache> {
        // sorts `/`-separated path components before any other
        // character, so a directory groups with its contents
        conn.create_collation("PATH", |a, b| path_cmp(a, b))?;

        conn.create_scalar_function(
            "store_path_name",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let s: String = ctx.get(0)?;
                Ok(zb_store::StorePath::parse(&s)
                    .ok()
                    .map(|p| p.name().to_string()))
            },
        )?;

        conn.execute_batch(SCHEMA)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(StampCache { conn })
    }

    /// Looks for a prior import of `root` that produced an object named
    /// `name` with exactly these stamps.
    pub fn lookup(
        &mut self,
        root: &str,
        name: &str,
        stamps: &[StampEntry],
    ) -> rusqlite::Result<Option<String>> {
        let candidates: Vec<(i64, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, store_path FROM source_imports \
                 WHERE root = ?1 AND store_path_name(store_path) = ?2 \
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map((root, name), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut want = stamps.to_vec();
        want.sort_by(|a, b| path_cmp(&a.path, &b.path));

        for (id, store_path) in candidates {
            let mut stmt = self.conn.prepare(
                "SELECT path, mode, size, stamp FROM source_stamps \
                 WHERE import_id = ?1 ORDER BY path COLLATE PATH",
            )?;
            let rows = stmt.query_map([id], |row| {
                Ok(StampEntry {
                    path: row.get(0)?,
                    mode: row.get::<_, i64>(1)? as u32,
                    size: row.get::<_, i64>(2)? as u64,
                    stamp: row.get(3)?,
                })
            })?;
            let recorded: Vec<StampEntry> = rows.collect::<rusqlite::Result<_>>()?;

            if recorded == want {
                debug!(root, store_path, "stamp cache hit");
                return Ok(Some(store_path));
            }
        }
        Ok(None)
    }

    /// Records that importing `root` with these stamps produced
    /// `store_path`, superseding earlier entries for the same pair.
    pub fn record(
        &mut self,
        root: &str,
        store_path: &str,
        stamps: &[StampEntry],
    ) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM source_imports WHERE root = ?1 AND store_path = ?2",
            (root, store_path),
        )?;
        tx.execute(
            "INSERT INTO source_imports (root, store_path) VALUES (?1, ?2)",
            (root, store_path),
        )?;
        let id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO source_stamps (import_id, path, mode, size, stamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entry in stamps {
                stmt.execute((
                    id,
                    &entry.path,
                    entry.mode as i64,
                    entry.size as i64,
                    &entry.stamp,
                ))?;
            }
        }
        tx.commit()
    }
}

/// Compares paths ordering the `/` separator before any other
/// character.
fn path_cmp(a: &str, b: &str) -> Ordering {
    let key = |c: u8| if c == b'/' { 0u16 } else { c as u16 + 1 };
    a.bytes().map(key).cmp(b.bytes().map(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<StampEntry> {
        vec![
            StampEntry {
                path: String::new(),
                mode: 0o40755,
                size: 0,
                stamp: "dir".to_string(),
            },
            StampEntry {
                path: "main.lua".to_string(),
                mode: 0o100644,
                size: 5,
                stamp: "1700000000.000000-5-42-33188-0-0".to_string(),
            },
        ]
    }

    #[test]
    fn record_then_lookup() {
        let mut cache = StampCache::open_in_memory().unwrap();
        let stamps = entries();
        let store_path = "/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-src";

        assert_eq!(cache.lookup("/home/src", "src", &stamps).unwrap(), None);

        cache.record("/home/src", store_path, &stamps).unwrap();
        assert_eq!(
            cache.lookup("/home/src", "src", &stamps).unwrap(),
            Some(store_path.to_string())
        );

        // a modified stamp misses
        let mut changed = stamps.clone();
        changed[1].stamp = "1700000001.000000-5-42-33188-0-0".to_string();
        assert_eq!(cache.lookup("/home/src", "src", &changed).unwrap(), None);

        // a different object name misses
        assert_eq!(cache.lookup("/home/src", "other", &stamps).unwrap(), None);
    }

    #[test]
    fn recording_twice_supersedes() {
        let mut cache = StampCache::open_in_memory().unwrap();
        let store_path = "/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-src";
        cache.record("/home/src", store_path, &entries()).unwrap();
        cache.record("/home/src", store_path, &entries()).unwrap();
        assert_eq!(
            cache.lookup("/home/src", "src", &entries()).unwrap(),
            Some(store_path.to_string())
        );
    }

    #[test]
    fn path_collation_orders_separator_first() {
        assert_eq!(path_cmp("a/b", "a+b"), Ordering::Less);
        assert_eq!(path_cmp("a", "a/b"), Ordering::Less);
        assert_eq!(path_cmp("a/b", "a/b"), Ordering::Equal);
    }
}
