//! Command queue and reply correlation.
//!
//! A command channel is one ordered byte stream shared by every request, so
//! replies carry no identifier and are matched purely by position. The
//! [`Correlator`] keeps two queues:
//!
//! - pending submissions, buffered while no channel exists and flushed in
//!   submission order once one does;
//! - in-flight reply slots, one per written submission that expects replies,
//!   popped oldest-first as replies arrive.
//!
//! A submission moves its handler into the in-flight queue only when its
//! bytes are handed out for writing, so the in-flight queue never holds more
//! slots than commands actually sent.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use sdrlib_core::error::{Error, Result};
use sdrlib_core::transport::ChannelKind;

/// Which written commands produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// The peer answers every command, handler or not.
    EveryCommand,
    /// Only submissions that come with a handler get a reply slot.
    WhenHandled,
}

/// Where a reply goes.
#[derive(Debug)]
pub enum ReplyHandler {
    /// A single-command submission; receives the bare reply.
    Single(oneshot::Sender<Result<Value>>),
    /// A multi-command submission; receives every reply at once, in order,
    /// after the last one arrives.
    Batch(oneshot::Sender<Result<Vec<Value>>>),
    /// Replies are handed back to the channel owner through
    /// [`Dispatch::Owned`] with this tag.
    Owned(u64),
}

impl ReplyHandler {
    /// Create a single-reply handler and the receiver that awaits it.
    pub fn single() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (ReplyHandler::Single(tx), rx)
    }

    /// Create a batch handler and the receiver that awaits it.
    pub fn batch() -> (Self, oneshot::Receiver<Result<Vec<Value>>>) {
        let (tx, rx) = oneshot::channel();
        (ReplyHandler::Batch(tx), rx)
    }

    /// Complete the handler with an error.
    pub fn fail(self, err: Error) {
        match self {
            ReplyHandler::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            ReplyHandler::Batch(tx) => {
                let _ = tx.send(Err(err));
            }
            ReplyHandler::Owned(tag) => debug!(tag, error = %err, "owned reply dropped"),
        }
    }
}

/// What the owner should do with an inbound reply.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// The reply went to a caller's handler.
    Delivered,
    /// More replies are needed before the slot's handler fires.
    Partial,
    /// The slot belongs to the channel owner.
    Owned { tag: u64, replies: Vec<Value> },
    /// The slot had no handler (a command sent under
    /// [`ReplyPolicy::EveryCommand`] without one).
    Unhandled(Value),
    /// No slot was waiting; the reply is unsolicited.
    Unmatched(Value),
}

#[derive(Debug)]
struct Submission {
    frames: Vec<Vec<u8>>,
    handler: Option<ReplyHandler>,
}

#[derive(Debug)]
struct Slot {
    expected: usize,
    replies: Vec<Value>,
    handler: Option<ReplyHandler>,
}

/// Queue of outbound commands and the reply slots they open.
#[derive(Debug)]
pub struct Correlator {
    policy: ReplyPolicy,
    queued: VecDeque<Submission>,
    in_flight: VecDeque<Slot>,
}

impl Correlator {
    pub fn new(policy: ReplyPolicy) -> Self {
        Correlator {
            policy,
            queued: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> ReplyPolicy {
        self.policy
    }

    /// Submissions waiting to be written.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Reply slots still open.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Queue one command, or several as a batch, for `channel`.
    ///
    /// Each frame is one complete wire command. Fails without queueing
    /// anything if `channel` is a data channel, if `frames` is empty, or if
    /// a [`ReplyHandler::Single`] is given more than one frame; the handler,
    /// if any, is completed with the same error.
    pub fn submit(
        &mut self,
        channel: ChannelKind,
        frames: Vec<Vec<u8>>,
        handler: Option<ReplyHandler>,
    ) -> Result<()> {
        let single = matches!(handler, Some(ReplyHandler::Single(_)));
        if let Some(err) = rejection(channel, frames.len(), single) {
            if let (Some(h), Some(copy)) = (handler, rejection(channel, frames.len(), single)) {
                h.fail(copy);
            }
            return Err(err);
        }

        self.queued.push_back(Submission { frames, handler });
        Ok(())
    }

    /// Take the next queued submission's bytes for writing, opening its
    /// reply slot.
    ///
    /// Call only while the channel is connected; the caller must write the
    /// returned bytes before taking more.
    pub fn take_outgoing(&mut self) -> Option<Vec<u8>> {
        let sub = self.queued.pop_front()?;
        let expected = match (self.policy, &sub.handler) {
            (ReplyPolicy::EveryCommand, _) => sub.frames.len(),
            (ReplyPolicy::WhenHandled, Some(_)) => sub.frames.len(),
            (ReplyPolicy::WhenHandled, None) => 0,
        };
        if expected > 0 {
            self.in_flight.push_back(Slot {
                expected,
                replies: Vec::with_capacity(expected),
                handler: sub.handler,
            });
        }
        Some(sub.frames.concat())
    }

    /// Route one reply to the oldest open slot.
    pub fn on_reply(&mut self, reply: Value) -> Dispatch {
        let Some(slot) = self.in_flight.front_mut() else {
            debug!("reply with no outstanding command");
            return Dispatch::Unmatched(reply);
        };
        slot.replies.push(reply);
        if slot.replies.len() < slot.expected {
            return Dispatch::Partial;
        }

        let Some(slot) = self.in_flight.pop_front() else {
            return Dispatch::Partial;
        };
        let mut replies = slot.replies;
        match slot.handler {
            Some(ReplyHandler::Single(tx)) => {
                let _ = tx.send(Ok(replies.remove(0)));
                Dispatch::Delivered
            }
            Some(ReplyHandler::Batch(tx)) => {
                let _ = tx.send(Ok(replies));
                Dispatch::Delivered
            }
            Some(ReplyHandler::Owned(tag)) => Dispatch::Owned { tag, replies },
            None => Dispatch::Unhandled(replies.remove(0)),
        }
    }

    /// Give up on the owner's submission tagged `tag`, queued or in flight.
    ///
    /// A reply the peer never sends (or that was dropped as malformed) would
    /// otherwise hold its slot open for good. Returns whether anything was
    /// removed.
    pub fn abandon(&mut self, tag: u64) -> bool {
        let owned =
            |h: &Option<ReplyHandler>| matches!(h, Some(ReplyHandler::Owned(t)) if *t == tag);
        if let Some(at) = self.in_flight.iter().position(|slot| owned(&slot.handler)) {
            self.in_flight.remove(at);
            debug!(tag, "abandoned in-flight reply slot");
            return true;
        }
        if let Some(at) = self.queued.iter().position(|sub| owned(&sub.handler)) {
            self.queued.remove(at);
            debug!(tag, "abandoned queued submission");
            return true;
        }
        false
    }

    /// The channel went away: every open slot fails with
    /// [`Error::ConnectionLost`]. Queued submissions are kept.
    pub fn on_disconnect(&mut self) {
        if !self.in_flight.is_empty() {
            warn!(count = self.in_flight.len(), "failing in-flight commands");
        }
        for slot in self.in_flight.drain(..) {
            if let Some(h) = slot.handler {
                h.fail(Error::ConnectionLost);
            }
        }
    }

    /// Fail everything, queued and in flight, with [`Error::Terminated`].
    pub fn close(&mut self) {
        for slot in self.in_flight.drain(..) {
            if let Some(h) = slot.handler {
                h.fail(Error::Terminated);
            }
        }
        for sub in self.queued.drain(..) {
            if let Some(h) = sub.handler {
                h.fail(Error::Terminated);
            }
        }
    }
}

/// Why a submission cannot be queued, if it cannot.
fn rejection(channel: ChannelKind, frames: usize, single: bool) -> Option<Error> {
    if channel == ChannelKind::Data {
        Some(Error::WrongChannel(channel))
    } else if frames == 0 {
        Some(Error::Protocol("empty command submission".into()))
    } else if frames > 1 && single {
        Some(Error::Protocol(
            "single-reply handler given a batch of commands".into(),
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(s: &str) -> Vec<u8> {
        format!("{s}\n").into_bytes()
    }

    fn drain(c: &mut Correlator) -> Vec<u8> {
        let mut wire = Vec::new();
        while let Some(bytes) = c.take_outgoing() {
            wire.extend(bytes);
        }
        wire
    }

    #[test]
    fn queued_commands_flush_in_submission_order() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        for cmd in ["frequency p1 166376000", "lna_gain p1 10", "start p1"] {
            c.submit(ChannelKind::Command, vec![line(cmd)], None).unwrap();
        }
        assert_eq!(c.queued_len(), 3);
        assert_eq!(
            drain(&mut c),
            b"frequency p1 166376000\nlna_gain p1 10\nstart p1\n"
        );
        assert_eq!(c.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn replies_match_in_fifo_order() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        let (h1, rx1) = ReplyHandler::single();
        let (h2, rx2) = ReplyHandler::single();
        c.submit(ChannelKind::Command, vec![line("a")], Some(h1)).unwrap();
        c.submit(ChannelKind::Command, vec![line("b")], Some(h2)).unwrap();
        drain(&mut c);

        assert_eq!(c.on_reply(json!({"n":1})), Dispatch::Delivered);
        assert_eq!(c.on_reply(json!({"n":2})), Dispatch::Delivered);
        assert_eq!(rx1.await.unwrap().unwrap(), json!({"n":1}));
        assert_eq!(rx2.await.unwrap().unwrap(), json!({"n":2}));
    }

    #[tokio::test]
    async fn batch_receives_all_replies_at_once() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        let (h, rx) = ReplyHandler::batch();
        c.submit(
            ChannelKind::Command,
            vec![line("x"), line("y"), line("z")],
            Some(h),
        )
        .unwrap();
        assert_eq!(c.take_outgoing().unwrap(), b"x\ny\nz\n");
        assert_eq!(c.in_flight_len(), 1);

        assert_eq!(c.on_reply(json!(1)), Dispatch::Partial);
        assert_eq!(c.on_reply(json!(2)), Dispatch::Partial);
        assert_eq!(c.on_reply(json!(3)), Dispatch::Delivered);
        assert_eq!(rx.await.unwrap().unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn handlerless_commands_open_no_slot_when_handled_policy() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        c.submit(ChannelKind::Command, vec![line("stop p1")], None).unwrap();
        c.submit(ChannelKind::Command, vec![line("list")], Some(ReplyHandler::Owned(7)))
            .unwrap();
        drain(&mut c);
        assert_eq!(c.in_flight_len(), 1);
        assert_eq!(
            c.on_reply(json!({"p1":{}})),
            Dispatch::Owned {
                tag: 7,
                replies: vec![json!({"p1":{}})]
            }
        );
    }

    #[test]
    fn every_command_policy_opens_unhandled_slots() {
        let mut c = Correlator::new(ReplyPolicy::EveryCommand);
        c.submit(ChannelKind::Command, vec![vec![1, 0, 0, 0, 1]], None)
            .unwrap();
        drain(&mut c);
        assert_eq!(c.in_flight_len(), 1);
        assert_eq!(
            c.on_reply(json!({"agc":0})),
            Dispatch::Unhandled(json!({"agc":0}))
        );
        assert_eq!(c.on_reply(json!({})), Dispatch::Unmatched(json!({})));
    }

    #[test]
    fn slots_open_only_when_written() {
        let mut c = Correlator::new(ReplyPolicy::EveryCommand);
        c.submit(ChannelKind::Command, vec![line("a")], None).unwrap();
        c.submit(ChannelKind::Command, vec![line("b")], None).unwrap();
        assert_eq!(c.in_flight_len(), 0);
        c.take_outgoing();
        assert_eq!(c.in_flight_len(), 1);
        assert_eq!(c.queued_len(), 1);
    }

    #[tokio::test]
    async fn data_channel_submission_fails_fast() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        let (h, rx) = ReplyHandler::single();
        let err = c
            .submit(ChannelKind::Data, vec![line("receive p1")], Some(h))
            .unwrap_err();
        assert!(matches!(err, Error::WrongChannel(ChannelKind::Data)));
        assert!(matches!(rx.await.unwrap(), Err(Error::WrongChannel(_))));
        assert!(!c.has_outgoing());
    }

    #[test]
    fn single_handler_rejects_batch() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        let (h, _rx) = ReplyHandler::single();
        assert!(matches!(
            c.submit(ChannelKind::Command, vec![line("a"), line("b")], Some(h)),
            Err(Error::Protocol(_))
        ));
        assert!(c.submit(ChannelKind::Command, vec![], None).is_err());
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_but_keeps_queue() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        let (sent, sent_rx) = ReplyHandler::single();
        let (waiting, mut waiting_rx) = ReplyHandler::single();
        c.submit(ChannelKind::Command, vec![line("a")], Some(sent)).unwrap();
        c.take_outgoing();
        c.submit(ChannelKind::Command, vec![line("b")], Some(waiting)).unwrap();

        c.on_disconnect();
        assert!(matches!(sent_rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(waiting_rx.try_recv().is_err());
        assert_eq!(c.queued_len(), 1);
        assert_eq!(c.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn abandoned_slot_lets_later_replies_through() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        c.submit(ChannelKind::Command, vec![line("list")], Some(ReplyHandler::Owned(1)))
            .unwrap();
        drain(&mut c);
        assert_eq!(c.in_flight_len(), 1);

        // The reply to the first `list` never arrived.
        assert!(c.abandon(1));
        assert!(!c.abandon(1));
        assert_eq!(c.in_flight_len(), 0);

        let (h, rx) = ReplyHandler::single();
        c.submit(ChannelKind::Command, vec![line("status")], Some(h)).unwrap();
        c.submit(ChannelKind::Command, vec![line("list")], Some(ReplyHandler::Owned(2)))
            .unwrap();
        drain(&mut c);
        assert_eq!(c.on_reply(json!({"ok":true})), Dispatch::Delivered);
        assert_eq!(
            c.on_reply(json!({"p1":{}})),
            Dispatch::Owned {
                tag: 2,
                replies: vec![json!({"p1":{}})]
            }
        );
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok":true}));
    }

    #[test]
    fn abandon_removes_a_queued_submission() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        c.submit(ChannelKind::Command, vec![line("stop 1")], None).unwrap();
        c.submit(ChannelKind::Command, vec![line("list")], Some(ReplyHandler::Owned(9)))
            .unwrap();
        assert!(c.abandon(9));
        assert_eq!(drain(&mut c), b"stop 1\n");
        assert_eq!(c.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn close_fails_everything() {
        let mut c = Correlator::new(ReplyPolicy::WhenHandled);
        let (h, rx) = ReplyHandler::single();
        c.submit(ChannelKind::Command, vec![line("a")], Some(h)).unwrap();
        c.close();
        assert!(matches!(rx.await.unwrap(), Err(Error::Terminated)));
        assert!(!c.has_outgoing());
    }
}
