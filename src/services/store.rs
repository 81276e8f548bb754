#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use log::{debug, info, warn};

use crate::utils::errors::Errors;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Matches the indentation of existing store documents.
const JSON_INDENT: &[u8] = b"    ";

// Appends waiting for the writer before senders are made to wait.
const STORE_QUEUE_DEPTH: usize = 256;

// ***************************************************************************
//                                  Types
// ***************************************************************************
/// The submitted fields of one record.
pub type Fields = BTreeMap<String, String>;

/// Timestamp key -> fields, the full contents of the store file.
pub type StoreDocument = BTreeMap<String, Fields>;

// ***************************************************************************
//                                JsonStore
// ***************************************************************************
/** Read-merge-write access to the store document.  JsonStore itself does no
 * locking; all appends in a running server go through the single writer
 * started by spawn_store.
 */
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {path: path.into()}
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---------------------------------------------------------------------------
    // load:
    // ---------------------------------------------------------------------------
    /** Read the whole document.  A missing or empty file is an empty document;
     * a file that does not parse as the timestamp -> fields mapping is
     * StoreCorrupt.
     */
    pub fn load(&self) -> Result<StoreDocument, Errors> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreDocument::new()),
            Err(e) => return Err(Errors::StoreUnwritable(self.display(), format!("unable to read: {}", e))),
        };

        if contents.trim().is_empty() {
            return Ok(StoreDocument::new());
        }

        serde_json::from_str(&contents)
            .map_err(|e| Errors::StoreCorrupt(self.display(), e.to_string()))
    }

    // ---------------------------------------------------------------------------
    // append:
    // ---------------------------------------------------------------------------
    /** Insert one record and rewrite the document.  A record already stored
     * under the same timestamp is replaced.  Returns the number of records in
     * the document after the write.
     */
    pub fn append(&self, timestamp: &str, fields: Fields) -> Result<usize, Errors> {
        let mut doc = self.load()?;
        if doc.insert(timestamp.to_string(), fields).is_some() {
            warn!("Record {} in {} was overwritten by a newer submission with the same timestamp.",
                  timestamp, self.display());
        }
        self.write(&doc)?;
        Ok(doc.len())
    }

    // ---------------------------------------------------------------------------
    // write:
    // ---------------------------------------------------------------------------
    /** Serialize into a sibling temporary file and rename it over the document
     * so readers only ever see a complete file.  The directory is synced after
     * the rename so the new entry survives a crash.
     */
    fn write(&self, doc: &StoreDocument) -> Result<(), Errors> {
        let unwritable = |e: std::io::Error| Errors::StoreUnwritable(self.display(), e.to_string());

        let dir = self.dir();
        fs::create_dir_all(dir).map_err(unwritable)?;

        let mut buf = Vec::with_capacity(4096);
        let mut ser = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(JSON_INDENT));
        doc.serialize(&mut ser)
            .map_err(|e| Errors::StoreUnwritable(self.display(), e.to_string()))?;
        buf.push(b'\n');

        let tmp = self.tmp_path();
        let result = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&buf)?;
                f.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(unwritable(e));
        }

        // The record is already in place; only its durability is in doubt.
        if let Err(e) = sync_dir(dir) {
            warn!("Unable to sync directory {} after writing {}: {}", dir.display(), self.display(), e);
        }
        Ok(())
    }

    // A bare file name lives in the working directory.
    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

// ***************************************************************************
//                               Store Writer
// ***************************************************************************
pub(crate) struct AppendRequest {
    timestamp: String,
    fields: Fields,
    reply: oneshot::Sender<Result<usize, Errors>>,
}

// ---------------------------------------------------------------------------
// StoreHandle:
// ---------------------------------------------------------------------------
/** Cloneable front door to the store writer.  Every append from every task
 * is queued to the one writer, which applies them one at a time.
 */
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<AppendRequest>,
}

impl StoreHandle {
    /// Queue an append and wait for it to be written.
    pub async fn append(&self, timestamp: String, fields: Fields) -> Result<usize, Errors> {
        let (reply, rx) = oneshot::channel();
        let req = AppendRequest {timestamp, fields, reply};
        if self.tx.send(req).await.is_err() {
            return Err(Errors::StoreUnavailable("store writer has stopped".to_string()));
        }
        match rx.await {
            Ok(r) => r,
            Err(_) => Err(Errors::StoreUnavailable("store writer dropped the request".to_string())),
        }
    }

    /// A handle whose requests are never written until the receiver is dropped.
    #[cfg(test)]
    pub(crate) fn stalled() -> (StoreHandle, mpsc::Receiver<AppendRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (StoreHandle {tx}, rx)
    }
}

impl std::fmt::Debug for AppendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendRequest").field("timestamp", &self.timestamp).finish()
    }
}

// ---------------------------------------------------------------------------
// spawn_store:
// ---------------------------------------------------------------------------
/** Start the single writer that owns the store file.  The writer runs on the
 * blocking pool and exits once every StoreHandle has been dropped.
 */
pub fn spawn_store(store: JsonStore) -> (StoreHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AppendRequest>(STORE_QUEUE_DEPTH);
    let join = tokio::task::spawn_blocking(move || {
        info!("Store writer started for {}.", store.path().display());
        while let Some(req) = rx.blocking_recv() {
            let result = store.append(&req.timestamp, req.fields);
            if req.reply.send(result).is_err() {
                debug!("Append of record {} finished after its caller went away.", req.timestamp);
            }
        }
        info!("Store writer for {} stopped.", store.path().display());
    });
    (StoreHandle {tx}, join)
}
