//! Worker-to-caller result channel.
//!
//! The worker writes exactly one length-prefixed JSON message carrying
//! `Ok(value)` or `Err(ProbeError)` to a pipe. On the caller side a reader
//! thread decodes it and hands it over a capacity-one channel, so the caller
//! can wait with a timeout while the pipe is drained concurrently.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crawlspace_common::constants::MAX_WORKER_MESSAGE_BYTES;
use crawlspace_common::error::ProbeError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// What a worker sends back: the probe's value or its failure.
pub type WorkerReply<T> = std::result::Result<T, ProbeError>;

/// Encodes `reply` as one frame.
///
/// # Errors
///
/// Returns an error if encoding fails, the frame exceeds the size bound,
/// or the write fails.
pub fn send<T: Serialize, W: Write>(writer: &mut W, reply: &WorkerReply<T>) -> io::Result<()> {
    let payload = serde_json::to_vec(reply)?;
    if payload.len() > MAX_WORKER_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("worker reply of {} bytes exceeds bound", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Decodes one frame.
///
/// # Errors
///
/// Returns `UnexpectedEof` if the writer went away before a full frame,
/// `InvalidData` for an oversized or undecodable frame.
pub fn recv<T: DeserializeOwned, R: Read>(reader: &mut R) -> io::Result<WorkerReply<T>> {
    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let len = usize::try_from(u64::from_le_bytes(len))
        .ok()
        .filter(|&n| n <= MAX_WORKER_MESSAGE_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "oversized worker reply"))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Outcome of waiting on a [`ReplyReceiver`].
#[derive(Debug)]
pub enum Received<T> {
    /// A complete reply arrived.
    Reply(WorkerReply<T>),
    /// The pipe failed or closed before a complete reply.
    Broken(io::Error),
    /// Nothing arrived within the timeout.
    TimedOut,
}

/// Caller side of the channel.
pub struct ReplyReceiver<T> {
    rx: Receiver<io::Result<WorkerReply<T>>>,
}

impl<T: DeserializeOwned + Send + 'static> ReplyReceiver<T> {
    /// Starts draining `reader` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader thread cannot be spawned.
    pub fn spawn<R: Read + Send + 'static>(mut reader: R) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = thread::Builder::new()
            .name("crawlspace-reply".into())
            .spawn(move || {
                let _ = tx.send(recv(&mut reader));
            })?;
        Ok(Self { rx })
    }

    /// Waits up to `timeout` for the reply.
    pub fn wait(&self, timeout: Duration) -> Received<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(reply)) => Received::Reply(reply),
            Ok(Err(e)) => Received::Broken(e),
            Err(RecvTimeoutError::Timeout) => Received::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Received::Broken(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "reply reader exited",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn value_frame_decodes() {
        let mut buf = Vec::new();
        send(&mut buf, &Ok::<_, ProbeError>(vec![1, 2, 3])).unwrap();
        let reply: WorkerReply<Vec<i32>> = recv(&mut Cursor::new(buf)).unwrap();
        assert_eq!(reply, Ok(vec![1, 2, 3]));
    }

    #[test]
    fn error_frame_keeps_kind_and_message() {
        let mut buf = Vec::new();
        send(&mut buf, &Err::<u8, _>(ProbeError::new("FooError", "oops"))).unwrap();
        let reply: WorkerReply<u8> = recv(&mut Cursor::new(buf)).unwrap();
        assert_eq!(reply, Err(ProbeError::new("FooError", "oops")));
    }

    #[test]
    fn truncated_frame_is_eof() {
        let mut buf = Vec::new();
        send(&mut buf, &Ok::<_, ProbeError>("hello")).unwrap();
        buf.truncate(buf.len() - 2);
        let err = recv::<String, _>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let buf = u64::MAX.to_le_bytes().to_vec();
        let err = recv::<String, _>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn receiver_reports_reply_and_closed_pipe() {
        let mut buf = Vec::new();
        send(&mut buf, &Ok::<_, ProbeError>(7u32)).unwrap();
        let rx = ReplyReceiver::<u32>::spawn(Cursor::new(buf)).unwrap();
        assert!(matches!(rx.wait(Duration::from_secs(5)), Received::Reply(Ok(7))));

        let rx = ReplyReceiver::<u32>::spawn(Cursor::new(Vec::new())).unwrap();
        assert!(matches!(rx.wait(Duration::from_secs(5)), Received::Broken(_)));
    }
}
