use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use ketch_base::{err, Result};

const DIR_MODE: u32 = 0o700;

/// Owns the single embedded key-value store file, one process-wide
/// instance as required by the concurrency model. One redb table per
/// resource type; keys are the 16-byte resource id, values are its JSON
/// marshalling (JSON, not msgpack, to keep persisted records readable on
/// disk independent of the wire encoding).
pub struct Persistence {
    db: Database,
}

impl Persistence {
    /// Opens (creating if absent) the store at `<data_dir>/<store_name>`.
    /// `data_dir` is created with directory mode 0700 if missing. Failure
    /// to open is fatal at start per the spec's persistence error policy.
    pub fn open(data_dir: &Path, store_name: &str) -> Result<Self> {
        create_dir_mode_0700(data_dir)?;
        let path: PathBuf = data_dir.join(store_name);
        let db = Database::create(&path)
            .map_err(|e| err(format!("failed to open store at {}: {e}", path.display())))?;
        Ok(Persistence { db })
    }

    pub fn put(&self, table_name: &'static str, id: Uuid, json: &[u8]) -> Result<()> {
        let table_def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table_name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table_def)?;
            table.insert(id.as_bytes().as_slice(), json)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, table_name: &'static str, id: Uuid) -> Result<()> {
        let table_def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table_name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table_def)?;
            table.remove(id.as_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Returns every `(id, json)` pair currently in `table_name`, creating
    /// the table if it does not exist yet.
    pub fn load_all(&self, table_name: &'static str) -> Result<Vec<(Uuid, Vec<u8>)>> {
        let table_def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table_name);
        let txn = self.db.begin_write()?;
        let mut out = Vec::new();
        {
            let table = txn.open_table(table_def)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let id = Uuid::from_slice(key.value()).map_err(|e| err(format!("malformed resource key: {e}")))?;
                out.push((id, value.value().to_vec()));
            }
        }
        txn.commit()?;
        Ok(out)
    }
}

#[cfg(unix)]
fn create_dir_mode_0700(dir: &Path) -> Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(DIR_MODE).create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_mode_0700(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}
