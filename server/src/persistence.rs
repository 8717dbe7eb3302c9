use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{channel, Sender};
use tokio::time::{delay_for, Duration};

use system::{
    bincode, CommittedOperation, DocumentSnapshot, DocumentStore, RoomId, SequenceNumber,
};

use crate::room::{RoomInternal, RoomMessage};

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Codec(bincode::Error),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<bincode::Error> for PersistenceError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err)
    }
}

#[derive(Debug)]
pub enum LogCommand {
    Append(CommittedOperation),
    /// Replaces the log with the operations newer than the last checkpoint.
    Rewrite { operations: Vec<CommittedOperation> },
}

fn snapshot_path(data_dir: &Path, room_id: &RoomId) -> PathBuf {
    data_dir.join(format!("{}.snapshot", room_id))
}

fn log_path(data_dir: &Path, room_id: &RoomId) -> PathBuf {
    data_dir.join(format!("{}.oplog", room_id))
}

/// Writes a full snapshot durably, retrying with backoff. The sequence it
/// reflects travels inside the blob.
pub async fn write_snapshot(
    data_dir: &Path,
    room_id: &RoomId,
    sequence: SequenceNumber,
    snapshot: &DocumentSnapshot,
) -> Result<(), PersistenceError> {
    let path = snapshot_path(data_dir, room_id);
    let tmp_path = path.with_extension("snapshot.tmp");

    let mut backoff = RETRY_BASE;
    let mut attempts = 0;
    loop {
        match write_snapshot_once(&tmp_path, &path, snapshot).await {
            Ok(()) => break,
            Err(err) => {
                attempts += 1;
                if attempts >= WRITE_ATTEMPTS {
                    return Err(err);
                }
                log::warn!("room {} snapshot write failed, retrying: {:?}", room_id, err);
                delay_for(backoff).await;
                backoff *= 2;
            }
        }
    }
    log::debug!("room {} snapshot written at sequence {}", room_id, sequence);
    Ok(())
}

async fn write_snapshot_once(
    tmp_path: &Path,
    path: &Path,
    snapshot: &DocumentSnapshot,
) -> Result<(), PersistenceError> {
    fs::write(tmp_path, snapshot.content()).await?;
    fs::rename(tmp_path, path).await?;
    Ok(())
}

pub async fn read_latest_snapshot(
    data_dir: &Path,
    room_id: &RoomId,
) -> Result<Option<DocumentSnapshot>, PersistenceError> {
    match fs::read(snapshot_path(data_dir, room_id)).await {
        Ok(content) => Ok(Some(DocumentSnapshot::from_vec(content))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn append_log(
    data_dir: &Path,
    room_id: &RoomId,
    operation: &CommittedOperation,
) -> Result<(), PersistenceError> {
    let frame = encode_frame(operation)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(data_dir, room_id))
        .await?;
    file.write_all(&frame).await?;
    Ok(())
}

async fn rewrite_log(
    data_dir: &Path,
    room_id: &RoomId,
    operations: &[CommittedOperation],
) -> Result<(), PersistenceError> {
    let mut buffer = Vec::new();
    for operation in operations {
        buffer.extend_from_slice(&encode_frame(operation)?);
    }
    let path = log_path(data_dir, room_id);
    let tmp_path = path.with_extension("oplog.tmp");
    fs::write(&tmp_path, &buffer).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(())
}

/// Logged operations with sequence greater than `after`, oldest first. A torn
/// tail from an interrupted append ends the scan rather than failing it.
pub async fn read_log_from(
    data_dir: &Path,
    room_id: &RoomId,
    after: SequenceNumber,
) -> Result<Vec<CommittedOperation>, PersistenceError> {
    let raw = match fs::read(log_path(data_dir, room_id)).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut operations = Vec::new();
    let mut cursor = 0usize;
    while cursor + 4 <= raw.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&raw[cursor..cursor + 4]);
        let frame_len = u32::from_le_bytes(len_bytes) as usize;
        let end = cursor + 4 + frame_len;
        if end > raw.len() {
            log::warn!("room {} log has a torn tail, truncating scan", room_id);
            break;
        }
        match bincode::deserialize::<CommittedOperation>(&raw[cursor + 4..end]) {
            Ok(operation) => {
                if operation.sequence > after {
                    operations.push(operation);
                }
            }
            Err(err) => {
                log::warn!("room {} log entry undecodable: {}", room_id, err);
                break;
            }
        }
        cursor = end;
    }
    Ok(operations)
}

/// Recovers a room's document: latest snapshot, then replay of everything
/// logged after it. `None` means the room has no durable state yet.
pub async fn load_room(
    data_dir: &Path,
    room_id: &RoomId,
) -> Result<Option<DocumentStore>, PersistenceError> {
    let snapshot = read_latest_snapshot(data_dir, room_id).await?;
    let had_snapshot = snapshot.is_some();
    let mut document = match snapshot {
        Some(snapshot) => DocumentStore::from_snapshot(&snapshot)?,
        None => DocumentStore::new(*room_id),
    };

    let logged = read_log_from(data_dir, room_id, document.head_sequence()).await?;
    if !had_snapshot && logged.is_empty() {
        return Ok(None);
    }
    for operation in logged {
        if operation.sequence != document.head_sequence() + 1 {
            log::warn!(
                "room {} log jumps from {} to {}, ignoring the rest",
                room_id,
                document.head_sequence(),
                operation.sequence
            );
            break;
        }
        document.apply(&operation);
    }
    Ok(Some(document))
}

/// Dedicated writer per room so appends never block the room actor. When an
/// append cannot be made durable after retries, the room is told to refuse
/// further writes. The handle lets the room await the drain of queued
/// appends before it reports itself closed.
pub fn spawn_log_writer(
    data_dir: PathBuf,
    room_id: RoomId,
    mut room_tx: Sender<RoomMessage>,
) -> (Sender<LogCommand>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = channel::<LogCommand>(256);

    let handle = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                LogCommand::Append(operation) => {
                    if let Err(err) = append_with_retry(&data_dir, &room_id, &operation).await {
                        log::error!("room {} log append gave up: {:?}", room_id, err);
                        let _ = room_tx
                            .send(RoomMessage::Internal(RoomInternal::LogDead))
                            .await;
                        return;
                    }
                }
                LogCommand::Rewrite { operations } => {
                    if let Err(err) = rewrite_log(&data_dir, &room_id, &operations).await {
                        // The snapshot is durable; a fat log is only a cost.
                        log::warn!("room {} log rewrite failed: {:?}", room_id, err);
                    }
                }
            }
        }
    });

    (tx, handle)
}

fn encode_frame(operation: &CommittedOperation) -> Result<Vec<u8>, PersistenceError> {
    let body = bincode::serialize(operation)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

async fn append_with_retry(
    data_dir: &Path,
    room_id: &RoomId,
    operation: &CommittedOperation,
) -> Result<(), PersistenceError> {
    let mut backoff = RETRY_BASE;
    let mut attempts = 0;
    loop {
        match append_log(data_dir, room_id, operation).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempts += 1;
                if attempts >= WRITE_ATTEMPTS {
                    return Err(err);
                }
                log::warn!("room {} log append failed, retrying: {:?}", room_id, err);
                delay_for(backoff).await;
                backoff *= 2;
            }
        }
    }
}
