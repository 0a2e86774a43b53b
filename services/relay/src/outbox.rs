//! Per-viewer outbound queue.
//!
//! Frames live in one bounded FIFO per (producer, monitor); when a queue is
//! full the oldest frame for that pair is dropped and replaced, never a newer
//! one.  Control messages (catalog updates, command acks/results) are
//! lossless up to a hard limit; overflowing it marks the viewer a slow
//! consumer and the session disconnects it.
//!
//! Control drains before frames, and frame queues drain round-robin across
//! (producer, monitor) pairs so one busy monitor cannot starve another.

use std::collections::{HashMap, VecDeque};

use relay_protocol::{FrameData, WsMessage};
use tokio::sync::{Mutex, Notify};

#[derive(Debug)]
pub struct ControlOverflow;

pub struct ViewerOutbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    frame_capacity: usize,
    control_limit: usize,
}

#[derive(Default)]
struct OutboxState {
    control: VecDeque<WsMessage>,
    frames: HashMap<(String, String), VecDeque<FrameData>>,
    // Keys with non-empty queues, in drain order.
    rotation: VecDeque<(String, String)>,
    dropped_frames: u64,
    overflowed: bool,
}

impl ViewerOutbox {
    pub fn new(frame_capacity: usize, control_limit: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            frame_capacity,
            control_limit,
        }
    }

    /// Queues a lossless control message.  On overflow the outbox is marked
    /// and the message rejected; the caller disconnects the viewer.
    pub async fn push_control(&self, msg: WsMessage) -> Result<(), ControlOverflow> {
        let mut guard = self.state.lock().await;
        if guard.control.len() >= self.control_limit {
            guard.overflowed = true;
            return Err(ControlOverflow);
        }
        guard.control.push_back(msg);
        drop(guard);
        self.notify.notify_one();
        Ok(())
    }

    /// Queues a frame, dropping the oldest queued frame for the same
    /// (producer, monitor) when the per-pair capacity is reached.
    pub async fn push_frame(&self, frame: FrameData) {
        let producer_id = frame.producer_id.clone().unwrap_or_default();
        let key = (producer_id, frame.monitor_id.clone());
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = state.frames.entry(key.clone()).or_default();
        if queue.is_empty() {
            state.rotation.push_back(key);
        }
        if queue.len() >= self.frame_capacity {
            queue.pop_front();
            state.dropped_frames += 1;
        }
        queue.push_back(frame);
        drop(guard);
        self.notify.notify_one();
    }

    /// Next message to write: control first, then frames round-robin.
    pub async fn pop(&self) -> Option<WsMessage> {
        let mut guard = self.state.lock().await;
        if let Some(msg) = guard.control.pop_front() {
            return Some(msg);
        }
        let state = &mut *guard;
        while let Some(key) = state.rotation.pop_front() {
            if let Some(queue) = state.frames.get_mut(&key) {
                if let Some(frame) = queue.pop_front() {
                    if queue.is_empty() {
                        state.frames.remove(&key);
                    } else {
                        state.rotation.push_back(key);
                    }
                    return Some(WsMessage::FrameData(frame));
                }
                state.frames.remove(&key);
            }
        }
        None
    }

    /// Parks until something is pushed.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub async fn overflowed(&self) -> bool {
        self.state.lock().await.overflowed
    }

    pub async fn dropped_frames(&self) -> u64 {
        self.state.lock().await.dropped_frames
    }

    pub async fn frame_queue_len(&self, producer_id: &str, monitor_id: &str) -> usize {
        self.state
            .lock()
            .await
            .frames
            .get(&(producer_id.to_owned(), monitor_id.to_owned()))
            .map_or(0, VecDeque::len)
    }
}
