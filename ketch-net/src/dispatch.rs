use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::msg::Msg;

/// Inbound messages are enqueued to a bounded, lossy channel by the
/// membership receive loop and drained serially by the dispatcher. The
/// capacity floor of 10 matches the spec; a full queue drops the newest
/// datagram rather than blocking the receiver.
pub const INBOUND_CHANNEL_CAPACITY: usize = 16;

pub fn inbound_channel() -> (SyncSender<Msg>, Receiver<Msg>) {
    sync_channel(INBOUND_CHANNEL_CAPACITY)
}
