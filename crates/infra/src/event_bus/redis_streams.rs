//! Redis Streams-backed message bus (durable log, "new messages only" reads).
//!
//! - **Publish**: `XADD <stream> [MAXLEN ~ n] * data <json>`
//! - **Subscribe**: a background reader issuing `XREAD BLOCK` from the last id
//!   present at subscription time, forwarding into a small bounded channel
//! - **No consumer groups**: every subscriber sees every message published
//!   after it subscribed, and nothing published before. Several workers on one
//!   stream therefore all receive each job; the dispatcher's claim on the
//!   store decides which of them runs it
//!
//! Entries published while no reader is attached stay in the stream but are
//! never dispatched. There is no acknowledgement and no redelivery.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use jobrelay_bus::{BusError, MessageBus, Subscription};
use jobrelay_core::JobMessage;

use crate::connection::{RedisConnection, bounded};

/// Default stream key.
pub const DEFAULT_STREAM_KEY: &str = "jobs";

/// Field holding the JSON envelope in each stream entry.
const DATA_FIELD: &str = "data";

/// Deadline for `XADD` and the subscription setup calls.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// How long one `XREAD` blocks server side.
const BLOCK_MS: u64 = 1_000;

/// Entries fetched per `XREAD`.
const READ_COUNT: usize = 10;

/// Reader → dispatcher buffer. Small, so a stalled consumer leaves entries in
/// the stream instead of in memory.
const FORWARD_BUFFER: usize = 10;

/// Pause after a failed read before trying again.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Durable bus over a single Redis stream.
pub struct RedisStreamsBus {
    client: redis::Client,
    conn: ConnectionManager,
    stream_key: String,
    max_length: usize,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for RedisStreamsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBus")
            .field("stream_key", &self.stream_key)
            .field("max_length", &self.max_length)
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBus {
    pub fn new(connection: &RedisConnection, stream_key: Option<String>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            client: connection.client().clone(),
            conn: connection.manager(),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            max_length: 0,
            closed,
        }
    }

    /// Trim the stream to roughly `max_length` entries on every publish.
    /// Zero keeps everything.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn xadd(&self, payload: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if self.max_length > 0 {
            cmd.arg("MAXLEN").arg("~").arg(self.max_length);
        }
        cmd.arg("*").arg(DATA_FIELD).arg(payload);
        cmd
    }

    /// Id of the newest entry, or `0-0` for an empty stream.
    async fn last_id(&self) -> Result<String, BusError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = bounded(
            COMMAND_TIMEOUT,
            redis::cmd("XREVRANGE")
                .arg(&self.stream_key)
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(1)
                .query_async(&mut conn),
        )
        .await
        .map_err(BusError::Backend)?;

        Ok(reply
            .ids
            .into_iter()
            .next()
            .map(|entry| entry.id)
            .unwrap_or_else(|| "0-0".to_string()))
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, message: JobMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::QueueClosed);
        }

        let payload = serde_json::to_string(&message)
            .map_err(|e| BusError::Backend(format!("encode message: {e}")))?;
        let cmd = self.xadd(&payload);
        let mut conn = self.conn.clone();

        let entry_id: String = bounded(COMMAND_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|e| BusError::Backend(format!("XADD failed: {e}")))?;

        debug!(job_id = %message.job_id, entry_id = %entry_id, stream = %self.stream_key, "published job message");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::QueueClosed);
        }

        let start_id = self.last_id().await?;

        // Blocking reads get their own connection so they never stall publishes.
        let reader_conn = match tokio::time::timeout(
            COMMAND_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(BusError::Backend(e.to_string())),
            Err(_) => return Err(BusError::Backend(format!("timed out after {COMMAND_TIMEOUT:?}"))),
        };

        let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
        info!(stream = %self.stream_key, start_id = %start_id, "subscribed to job stream");
        tokio::spawn(read_loop(
            reader_conn,
            self.stream_key.clone(),
            start_id,
            tx,
            self.closed.subscribe(),
        ));

        Ok(Subscription::new(rx))
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(stream = %self.stream_key, "redis stream bus closed");
        }
    }
}

async fn read_batch(
    conn: &mut MultiplexedConnection,
    stream_key: &str,
    after_id: &str,
) -> redis::RedisResult<Option<StreamReadReply>> {
    redis::cmd("XREAD")
        .arg("COUNT")
        .arg(READ_COUNT)
        .arg("BLOCK")
        .arg(BLOCK_MS)
        .arg("STREAMS")
        .arg(stream_key)
        .arg(after_id)
        .query_async(conn)
        .await
}

fn decode_entry(entry: &StreamId) -> Option<JobMessage> {
    let raw: String = match entry.get(DATA_FIELD) {
        Some(raw) => raw,
        None => {
            warn!(entry_id = %entry.id, "stream entry has no data field");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(entry_id = %entry.id, error = %e, "skipping undecodable stream entry");
            None
        }
    }
}

async fn read_loop(
    mut conn: MultiplexedConnection,
    stream_key: String,
    mut last_id: String,
    tx: mpsc::Sender<JobMessage>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        if *closed.borrow() {
            break;
        }

        let reply = tokio::select! {
            _ = closed.changed() => break,
            reply = read_batch(&mut conn, &stream_key, &last_id) => reply,
        };

        match reply {
            Ok(Some(reply)) => {
                for entry in reply.keys.into_iter().flat_map(|key| key.ids) {
                    last_id = entry.id.clone();
                    let Some(message) = decode_entry(&entry) else {
                        continue;
                    };
                    if tx.send(message).await.is_err() {
                        debug!(stream = %stream_key, "subscriber dropped, stopping reader");
                        return;
                    }
                }
            }
            // BLOCK expired without new entries.
            Ok(None) => {}
            Err(e) => {
                warn!(stream = %stream_key, error = %e, "stream read failed, retrying");
                tokio::select! {
                    _ = closed.changed() => break,
                    _ = tokio::time::sleep(RETRY_PAUSE) => {}
                }
            }
        }
    }

    debug!(stream = %stream_key, "stream reader stopped");
}
