use crate::errors::Error;
use crate::reply_queue::ReplyQueue;
use amq_protocol::frame::AMQPFrame;
use log::{error, trace};

/// One logical conversation multiplexed over the connection.
///
/// The connection owns the channel for routing purposes; the layer above
/// drives protocol operations through the channel's reply queue and the
/// connection's request/reply primitive. Content frames are delivered to the
/// consumer sink when one is installed, otherwise they queue up alongside
/// method replies.
pub struct Channel {
    id: u16,
    open: bool,
    replies: ReplyQueue,
    consumer: Option<Box<dyn FnMut(AMQPFrame)>>,
    on_error: Option<Box<dyn FnMut(Error)>>,
}

impl Channel {
    pub(crate) fn new(id: u16) -> Channel {
        Channel {
            id,
            open: false,
            replies: ReplyQueue::new(),
            consumer: None,
            on_error: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn reply_queue(&mut self) -> &mut ReplyQueue {
        &mut self.replies
    }

    /// Install the sink that receives content (header/body) frames. Method
    /// frames always go through the reply queue.
    pub fn set_consumer<F>(&mut self, consumer: F)
    where
        F: FnMut(AMQPFrame) + 'static,
    {
        self.consumer = Some(Box::new(consumer));
    }

    pub fn clear_consumer(&mut self) {
        self.consumer = None;
    }

    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: FnMut(Error) + 'static,
    {
        self.on_error = Some(Box::new(handler));
    }

    pub(crate) fn push_or_consume(&mut self, frame: AMQPFrame) {
        match frame {
            frame @ AMQPFrame::Method(..) => self.replies.push(frame),
            frame @ AMQPFrame::Header(..) => self.deliver(frame),
            frame @ AMQPFrame::Body(..) => self.deliver(frame),
            frame => {
                trace!("channel {} queueing frame {:?}", self.id, frame);
                self.replies.push(frame);
            }
        }
    }

    fn deliver(&mut self, frame: AMQPFrame) {
        match &mut self.consumer {
            Some(consumer) => consumer(frame),
            None => self.replies.push(frame),
        }
    }

    pub(crate) fn emit_error(&mut self, err: Error) {
        match &mut self.on_error {
            Some(handler) => handler(err),
            None => error!("channel {}: {}", self.id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn method_frames_queue_even_with_consumer() {
        let mut channel = Channel::new(4);
        let seen = Rc::new(RefCell::new(0));
        let seen2 = Rc::clone(&seen);
        channel.set_consumer(move |_| *seen2.borrow_mut() += 1);

        channel.push_or_consume(AMQPFrame::Heartbeat(4));
        assert_eq!(*seen.borrow(), 0);
        assert_eq!(channel.reply_queue().backlog_len(), 1);
    }

    #[test]
    fn body_frames_reach_consumer() {
        let mut channel = Channel::new(4);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        channel.set_consumer(move |frame| seen2.borrow_mut().push(frame));

        channel.push_or_consume(AMQPFrame::Body(4, b"payload".to_vec()));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(channel.reply_queue().backlog_len(), 0);
    }

    #[test]
    fn body_frames_queue_without_consumer() {
        let mut channel = Channel::new(4);
        channel.push_or_consume(AMQPFrame::Body(4, b"payload".to_vec()));
        assert_eq!(channel.reply_queue().backlog_len(), 1);
    }

    #[test]
    fn errors_reach_handler() {
        let mut channel = Channel::new(4);
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        channel.set_error_handler(move |err| *seen2.borrow_mut() = Some(err.to_string()));

        channel.emit_error(Error::ConnectionNotOpen);
        assert_eq!(seen.borrow().as_deref(), Some("connection is not open"));
    }
}
