#![forbid(unsafe_code)]

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use log::{debug, error, info, warn};

use crate::services::store::StoreHandle;
use crate::utils::errors::Errors;
use crate::utils::form_utils::MonotonicClock;
use crate::utils::urlencoded::Submission;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Larger than any UDP payload, so a received datagram is never truncated.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

// Appends awaiting the store writer before the loop stops receiving.
const MAX_INFLIGHT_APPENDS: usize = 64;

// ***************************************************************************
//                               IngestSource
// ***************************************************************************
/** Where raw submission bodies arrive from. */
#[derive(Debug)]
pub enum IngestSource {
    Udp(UdpSocket),
    Channel(mpsc::Receiver<Vec<u8>>),
}

impl IngestSource {
    // ---------------------------------------------------------------------------
    // bind_udp:
    // ---------------------------------------------------------------------------
    /** Bind the ingest datagram endpoint.  Failure here is fatal at startup. */
    pub async fn bind_udp(addr: &str) -> Result<IngestSource, Errors> {
        let socket = UdpSocket::bind(addr).await
            .map_err(|e| Errors::BindFailed("ingest listener".to_string(), addr.to_string(), e))?;
        Ok(IngestSource::Udp(socket))
    }

    /// Bound address, for udp sources.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            IngestSource::Udp(s) => s.local_addr().ok(),
            IngestSource::Channel(_) => None,
        }
    }

    // ---------------------------------------------------------------------------
    // recv:
    // ---------------------------------------------------------------------------
    /** Wait for the next message and its origin.  None means the source is
     * exhausted (every channel sender dropped).
     */
    pub(crate) async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(Vec<u8>, String)>> {
        match self {
            IngestSource::Udp(socket) => {
                let (len, from) = socket.recv_from(buf).await?;
                Ok(Some((buf[..len].to_vec(), from.to_string())))
            },
            IngestSource::Channel(rx) => {
                Ok(rx.recv().await.map(|body| (body, "channel".to_string())))
            },
        }
    }
}

// ***************************************************************************
//                              IngestSummary
// ***************************************************************************
/** Counts reported when the listener stops. */
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: u64,
    pub persisted: u64,
    pub malformed: u64,
    pub lost: u64,
}

// ***************************************************************************
//                              Receive Loop
// ***************************************************************************
// ---------------------------------------------------------------------------
// run_ingest_listener:
// ---------------------------------------------------------------------------
/** Receive submissions until shutdown is signalled or the source closes.
 *
 * Each message is decoded in the loop and given the next monotonic
 * timestamp; the append itself is handed to the store writer so the loop
 * keeps receiving while the file is written.  Once MAX_INFLIGHT_APPENDS
 * appends are pending, receiving pauses until one finishes, so a stalled
 * writer backs up into the source rather than into memory.  Bad messages
 * and failed appends are logged and counted, never fatal.  Appends still in
 * flight when the loop stops are awaited before returning.
 */
pub async fn run_ingest_listener(mut source: IngestSource,
                                 store: StoreHandle,
                                 mut shutdown: watch::Receiver<bool>)
    -> IngestSummary
{
    let mut summary = IngestSummary::default();
    let mut clock = MonotonicClock::new();
    let mut inflight: JoinSet<(String, Result<usize, Errors>)> = JoinSet::new();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    match source.local_addr() {
        Some(addr) => info!("Ingest listener receiving datagrams on {}.", addr),
        None => info!("Ingest listener receiving from the in-process channel."),
    }

    loop {
        tokio::select! {
            biased;

            _ = stop_signalled(&mut shutdown) => {
                info!("Ingest listener shutting down.");
                break;
            },

            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                tally(&mut summary, done);
            },

            msg = source.recv(&mut buf), if inflight.len() < MAX_INFLIGHT_APPENDS => match msg {
                Ok(Some((raw, from))) => {
                    summary.received += 1;
                    match decode_message(&raw, &from) {
                        Ok(submission) => {
                            let timestamp = clock.next_key();
                            let fields = submission.into_fields();
                            let store = store.clone();
                            inflight.spawn(async move {
                                let result = store.append(timestamp.clone(), fields).await;
                                (timestamp, result)
                            });
                        },
                        Err(e) => {
                            summary.malformed += 1;
                            warn!("{} Dropping message from {}.", e, from);
                        },
                    }
                },
                Ok(None) => {
                    info!("Ingest source closed.");
                    break;
                },
                Err(e) => {
                    // ICMP errors from earlier traffic surface here on some
                    // platforms; the socket itself is still usable.
                    error!("Ingest receive failed: {}", e);
                },
            },
        }
    }

    while let Some(done) = inflight.join_next().await {
        tally(&mut summary, done);
    }

    info!("Ingest listener stopped: {:?}", summary);
    summary
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
async fn stop_signalled(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the wait.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn decode_message(raw: &[u8], from: &str) -> Result<Submission, Errors> {
    let submission = Submission::parse(raw)?;
    info!("Received submission with {} field(s) from {}.", submission.pairs().len(), from);
    debug!("Submission from {}: {:?}", from, submission.pairs());
    Ok(submission)
}

fn tally(summary: &mut IngestSummary, done: Result<(String, Result<usize, Errors>), JoinError>) {
    match done {
        Ok((timestamp, Ok(count))) => {
            summary.persisted += 1;
            info!("Record {} was added to the store ({} records).", timestamp, count);
        },
        Ok((timestamp, Err(e @ Errors::StoreCorrupt(..)))) => {
            summary.lost += 1;
            error!("SUBMISSION LOST, record {} not written. {} Repair or move the file to resume ingest.", timestamp, e);
        },
        Ok((timestamp, Err(e))) => {
            summary.lost += 1;
            error!("SUBMISSION LOST, record {} not written: {}", timestamp, e);
        },
        Err(e) => {
            summary.lost += 1;
            error!("Append task failed: {}", e);
        },
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::services::forwarder::Forwarder;
    use crate::services::store::{spawn_store, JsonStore};

    fn store_in(dir: &TempDir) -> JsonStore {
        JsonStore::new(dir.path().join("storage/data.json"))
    }

    #[tokio::test]
    async fn channel_submissions_are_persisted() {
        let dir = TempDir::new().unwrap();
        let (handle, writer) = spawn_store(store_in(&dir));
        let (fwd, source) = Forwarder::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(run_ingest_listener(source, handle, stop_rx));

        fwd.forward(b"name=Jane+Doe&age=30").await.unwrap();
        fwd.forward(b"name=John&age=41\n").await.unwrap();
        drop(fwd);

        let summary = listener.await.unwrap();
        writer.await.unwrap();
        assert_eq!(summary, IngestSummary {received: 2, persisted: 2, malformed: 0, lost: 0});

        let doc = store_in(&dir).load().unwrap();
        assert_eq!(doc.len(), 2);
        let mut records: Vec<_> = doc.values().cloned().collect();
        records.sort_by(|a, b| a["name"].cmp(&b["name"]));
        assert_eq!(records[0]["name"], "Jane Doe");
        assert_eq!(records[0]["age"], "30");
        assert_eq!(records[1]["name"], "John");
        assert_eq!(records[1]["age"], "41");
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_and_loop_continues() {
        let dir = TempDir::new().unwrap();
        let (handle, _writer) = spawn_store(store_in(&dir));
        let (fwd, source) = Forwarder::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(run_ingest_listener(source, handle, stop_rx));

        fwd.forward(b"no-equals-here").await.unwrap();
        fwd.forward(b"\xff\xfe").await.unwrap();
        fwd.forward(b"ok=1").await.unwrap();
        drop(fwd);

        let summary = listener.await.unwrap();
        assert_eq!(summary.received, 3);
        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.persisted, 1);
        assert_eq!(store_in(&dir).load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_store_loses_submission_but_keeps_listening() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ broken").unwrap();

        let (handle, _writer) = spawn_store(store.clone());
        let (fwd, source) = Forwarder::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(run_ingest_listener(source, handle, stop_rx));

        fwd.forward(b"a=1").await.unwrap();
        fwd.forward(b"b=2").await.unwrap();
        drop(fwd);

        let summary = listener.await.unwrap();
        assert_eq!(summary.received, 2);
        assert_eq!(summary.lost, 2);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{ broken");
    }

    #[tokio::test]
    async fn udp_datagrams_are_persisted_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let (handle, writer) = spawn_store(store.clone());
        let source = IngestSource::bind_udp("127.0.0.1:0").await.unwrap();
        let addr = source.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(run_ingest_listener(source, handle, stop_rx));

        let fwd = Forwarder::udp(&addr.to_string()).await.unwrap();
        fwd.forward(b"name=Jane+Doe&age=30").await.unwrap();

        // Datagram delivery is asynchronous; poll the document.
        let mut doc = store.load().unwrap();
        for _ in 0..200 {
            if !doc.is_empty() {break;}
            tokio::time::sleep(Duration::from_millis(10)).await;
            doc = store.load().unwrap();
        }
        assert_eq!(doc.len(), 1);
        let fields = doc.values().next().unwrap();
        assert_eq!(fields["name"], "Jane Doe");
        assert_eq!(fields["age"], "30");

        stop_tx.send(true).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), listener).await
            .expect("listener did not stop").unwrap();
        writer.await.unwrap();
        assert_eq!(summary.persisted, 1);
    }

    #[tokio::test]
    async fn large_datagram_is_not_truncated() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let (handle, _writer) = spawn_store(store.clone());
        let source = IngestSource::bind_udp("127.0.0.1:0").await.unwrap();
        let addr = source.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(run_ingest_listener(source, handle, stop_rx));

        let long = "x".repeat(8000);
        let fwd = Forwarder::udp(&addr.to_string()).await.unwrap();
        fwd.forward(format!("note={}&end=1", long).as_bytes()).await.unwrap();

        let mut doc = store.load().unwrap();
        for _ in 0..200 {
            if !doc.is_empty() {break;}
            tokio::time::sleep(Duration::from_millis(10)).await;
            doc = store.load().unwrap();
        }
        let fields = doc.values().next().expect("no record written");
        assert_eq!(fields["note"].len(), 8000);
        assert_eq!(fields["end"], "1");

        stop_tx.send(true).unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_writer_pauses_receiving() {
        let (handle, stalled) = StoreHandle::stalled();
        let (fwd, source) = Forwarder::channel(256);
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(run_ingest_listener(source, handle, stop_rx));

        let total = MAX_INFLIGHT_APPENDS + 20;
        for i in 0..total {
            fwd.forward(format!("n={}", i).as_bytes()).await.unwrap();
        }

        // Messages the listener has not taken stay queued in the channel.
        let queued = || match &fwd {
            Forwarder::Channel(tx) => tx.max_capacity() - tx.capacity(),
            Forwarder::Udp {..} => unreachable!(),
        };
        for _ in 0..200 {
            if queued() == total - MAX_INFLIGHT_APPENDS {break;}
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queued(), total - MAX_INFLIGHT_APPENDS);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queued(), total - MAX_INFLIGHT_APPENDS);

        // Stop first, then let the pending appends fail.
        stop_tx.send(true).unwrap();
        drop(stalled);
        let summary = tokio::time::timeout(Duration::from_secs(5), listener).await
            .expect("listener did not stop").unwrap();
        assert_eq!(summary.received, MAX_INFLIGHT_APPENDS as u64);
        assert_eq!(summary.lost, MAX_INFLIGHT_APPENDS as u64);
    }
}
