use amq_protocol::frame::AMQPFrame;
use std::collections::VecDeque;
use std::fmt;

type Waiter = Box<dyn FnOnce(AMQPFrame)>;

/// Ordered rendezvous between asynchronously arriving frames and the
/// callers waiting for them. One exists for the connection (channel 0) and
/// one per channel.
///
/// A push either satisfies the oldest pending waiter immediately or joins the
/// backlog; a `next` either consumes the oldest backlogged frame immediately
/// or registers a waiter. The backlog and the waiter list are never both
/// nonempty.
#[derive(Default)]
pub struct ReplyQueue {
    backlog: VecDeque<AMQPFrame>,
    waiters: VecDeque<Waiter>,
}

impl ReplyQueue {
    pub fn new() -> ReplyQueue {
        ReplyQueue::default()
    }

    pub fn push(&mut self, frame: AMQPFrame) {
        match self.waiters.pop_front() {
            Some(waiter) => waiter(frame),
            None => self.backlog.push_back(frame),
        }
    }

    pub fn next<F>(&mut self, f: F)
    where
        F: FnOnce(AMQPFrame) + 'static,
    {
        match self.backlog.pop_front() {
            Some(frame) => f(frame),
            None => self.waiters.push_back(Box::new(f)),
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }
}

impl fmt::Debug for ReplyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyQueue")
            .field("backlog", &self.backlog.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn frame(channel_id: u16) -> AMQPFrame {
        AMQPFrame::Heartbeat(channel_id)
    }

    fn channel_of(frame: &AMQPFrame) -> u16 {
        match frame {
            AMQPFrame::Heartbeat(id) => *id,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn push_then_next_consumes_backlog() {
        let mut q = ReplyQueue::new();
        q.push(frame(3));
        assert_eq!(q.backlog_len(), 1);

        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        q.next(move |f| *got2.borrow_mut() = Some(channel_of(&f)));
        assert_eq!(*got.borrow(), Some(3));
        assert_eq!(q.backlog_len(), 0);
        assert_eq!(q.pending_waiters(), 0);
    }

    #[test]
    fn next_then_push_satisfies_waiter() {
        let mut q = ReplyQueue::new();
        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        q.next(move |f| *got2.borrow_mut() = Some(channel_of(&f)));
        assert_eq!(q.pending_waiters(), 1);

        q.push(frame(9));
        assert_eq!(*got.borrow(), Some(9));
        assert_eq!(q.pending_waiters(), 0);
        assert_eq!(q.backlog_len(), 0);
    }

    #[test]
    fn waiters_are_fifo() {
        let mut q = ReplyQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in &["first", "second"] {
            let order = Rc::clone(&order);
            q.next(move |f| order.borrow_mut().push((*tag, channel_of(&f))));
        }

        q.push(frame(1));
        q.push(frame(2));
        assert_eq!(*order.borrow(), vec![("first", 1), ("second", 2)]);
    }

    #[test]
    fn backlog_is_fifo() {
        let mut q = ReplyQueue::new();
        q.push(frame(1));
        q.push(frame(2));

        let order = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let order = Rc::clone(&order);
            q.next(move |f| order.borrow_mut().push(channel_of(&f)));
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
