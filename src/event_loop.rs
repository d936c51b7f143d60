use crate::errors::*;
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::timer::Timer;
use snafu::ResultExt;

pub(crate) const STREAM: Token = Token(0);
pub(crate) const HEARTBEAT: Token = Token(1);

/// The poll and timer a [`Connection`](crate::Connection) runs on. Built by
/// the caller and handed to the connection at construction; the connection
/// owns it for the rest of its life.
pub struct Reactor {
    pub(crate) poll: Poll,
    pub(crate) events: Events,
    pub(crate) timer: Timer<()>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        let poll = Poll::new().context(IoSnafu)?;
        let timer = Timer::default();
        poll.register(&timer, HEARTBEAT, Ready::readable(), PollOpt::edge())
            .context(IoSnafu)?;
        Ok(Reactor {
            poll,
            events: Events::with_capacity(128),
            timer,
        })
    }
}
