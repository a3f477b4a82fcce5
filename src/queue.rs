use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::Message;

#[derive(Default)]
struct State {
    messages: VecDeque<Message>,
    /// Sum of the payload lengths in `messages`.
    buffered: usize,
    close_request: Option<(u16, String)>,
}

/// Outgoing messages shared between the [`WebSocket`](crate::WebSocket) and its driver.
///
/// The facade pushes, the driver pops. The buffered byte count is updated under the same lock
/// as the queue, so [`SendQueue::buffered_amount`] always matches what is still queued.
#[derive(Default)]
pub struct SendQueue {
    state: Mutex<State>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        let mut state = self.state.lock();
        state.buffered += message.len();
        state.messages.push_back(message);
    }

    pub fn pop(&self) -> Option<Message> {
        let mut state = self.state.lock();
        let message = state.messages.pop_front()?;
        state.buffered -= message.len();
        Some(message)
    }

    /// Bytes of payload queued and not yet handed to the driver.
    pub fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued message.
    pub fn flush_all(&self) {
        let mut state = self.state.lock();
        if !state.messages.is_empty() {
            log::debug!("discarding {} unsent messages", state.messages.len());
        }
        state.messages.clear();
        state.buffered = 0;
    }

    /// Records the close frame the driver sends when it shuts down. A later request replaces
    /// an earlier one.
    pub fn request_close(&self, code: u16, reason: impl Into<String>) {
        self.state.lock().close_request = Some((code, reason.into()));
    }

    pub fn take_close_request(&self) -> Option<(u16, String)> {
        self.state.lock().close_request.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_amount_follows_queue() {
        let queue = SendQueue::new();
        assert_eq!(queue.buffered_amount(), 0);

        queue.push(Message::text("hello").unwrap());
        queue.push(Message::binary(vec![0u8; 1000]).unwrap());
        assert_eq!(queue.buffered_amount(), 1005);
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        assert!(first.is_text());
        assert_eq!(queue.buffered_amount(), 1000);

        queue.flush_all();
        assert!(queue.is_empty());
        assert_eq!(queue.buffered_amount(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_close_request() {
        let queue = SendQueue::new();
        assert!(queue.take_close_request().is_none());

        queue.request_close(1000, "bye");
        queue.request_close(4000, "later");
        assert_eq!(queue.take_close_request(), Some((4000, "later".to_owned())));
        assert!(queue.take_close_request().is_none());
    }
}
