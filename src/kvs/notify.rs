//! Change notifications
//!
//! A successful write sends one point-to-point message to every rank that
//! subscribed to the entry, tagged with the entry's slot index. The store
//! only ever sends; receiving is up to the caller.
//!
//! `SocketNotifier` / `NotificationListener` implement the channel with one
//! Unix datagram socket per rank inside a shared directory.

use crate::common::{Error, Result};
use crate::kvs::{Rank, SlotIndex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Payload carried by every update notification.
pub const UPDATE_CODE: u32 = 31173;

/// Send side of the messaging channel.
pub trait Notifier {
    /// Deliver one notification tagged `slot` to `rank`. May block.
    fn notify(&self, rank: Rank, slot: SlotIndex) -> Result<()>;
}

impl<T: Notifier + ?Sized> Notifier for &T {
    fn notify(&self, rank: Rank, slot: SlotIndex) -> Result<()> {
        (**self).notify(rank, slot)
    }
}

impl<T: Notifier + ?Sized> Notifier for Box<T> {
    fn notify(&self, rank: Rank, slot: SlotIndex) -> Result<()> {
        (**self).notify(rank, slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub slot: u32,
    pub code: u32,
}

impl Notification {
    pub fn update(slot: SlotIndex) -> Self {
        Self {
            slot: slot as u32,
            code: UPDATE_CODE,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Other(format!("encode notification: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::Other(format!("decode notification: {}", e)))
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _rank: Rank, _slot: SlotIndex) -> Result<()> {
        Ok(())
    }
}

/// Keeps notifications in memory, in send order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Rank, SlotIndex)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything recorded so far.
    pub fn take(&self) -> Vec<(Rank, SlotIndex)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, rank: Rank, slot: SlotIndex) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((rank, slot));
        Ok(())
    }
}

fn socket_path(dir: &Path, rank: Rank) -> PathBuf {
    dir.join(format!("rank-{}.sock", rank))
}

/// Sends notifications as datagrams to `<dir>/rank-<r>.sock`.
#[derive(Debug)]
pub struct SocketNotifier {
    dir: PathBuf,
    socket: UnixDatagram,
}

impl SocketNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            socket: UnixDatagram::unbound()?,
        })
    }
}

impl Notifier for SocketNotifier {
    fn notify(&self, rank: Rank, slot: SlotIndex) -> Result<()> {
        let payload = Notification::update(slot).encode()?;
        let path = socket_path(&self.dir, rank);
        self.socket
            .send_to(&payload, &path)
            .map_err(|e| Error::Notify {
                rank,
                reason: format!("{}: {}", path.display(), e),
            })?;
        tracing::trace!("Notified rank {} about slot {}", rank, slot);
        Ok(())
    }
}

/// Receive side for one rank.
///
/// Notifications for other slots that arrive while waiting are kept and
/// handed out by later calls.
#[derive(Debug)]
pub struct NotificationListener {
    path: PathBuf,
    socket: UnixDatagram,
    pending: VecDeque<Notification>,
}

impl NotificationListener {
    /// Bind this rank's socket, replacing a stale one.
    pub fn bind(dir: impl AsRef<Path>, rank: Rank) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = socket_path(dir, rank);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self {
            path,
            socket,
            pending: VecDeque::new(),
        })
    }

    /// Block for the next notification on any slot.
    pub fn recv(&mut self) -> Result<Notification> {
        if let Some(n) = self.pending.pop_front() {
            return Ok(n);
        }
        self.recv_socket()
    }

    /// Block until a notification tagged `slot` arrives.
    pub fn wait_for(&mut self, slot: SlotIndex) -> Result<Notification> {
        if let Some(pos) = self.pending.iter().position(|n| n.slot as usize == slot) {
            if let Some(n) = self.pending.remove(pos) {
                return Ok(n);
            }
        }
        loop {
            let n = self.recv_socket()?;
            if n.slot as usize == slot {
                return Ok(n);
            }
            self.pending.push_back(n);
        }
    }

    fn recv_socket(&self) -> Result<Notification> {
        let mut buf = [0u8; 64];
        let len = self.socket.recv(&mut buf)?;
        Notification::decode(&buf[..len])
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        _ = std::fs::remove_file(&self.path);
    }
}
