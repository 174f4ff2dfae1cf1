//! Dispatch of inbound envelopes by sender.
//!
//! A [`MessageRouter`] maps participant indices to the handler that consumes envelopes
//! sent by that participant. The session links one [`PeerHandle`](super::protocol::PeerHandle)
//! per remote participant, but any [`MessageHandler`] works, including plain closures.

use crate::network::messages::Message;
use crate::{ParticipantIndex, RollbackError};
use std::collections::BTreeMap;
use tracing::trace;

/// Consumes envelopes routed to it.
pub trait MessageHandler {
    /// Handles one envelope. Errors are reported back to the caller of [`MessageRouter::route`].
    fn on_message(&mut self, msg: Message) -> Result<(), RollbackError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(Message) -> Result<(), RollbackError>,
{
    fn on_message(&mut self, msg: Message) -> Result<(), RollbackError> {
        self(msg)
    }
}

/// Maps participant indices to handlers.
///
/// # Examples
///
/// ```
/// use lockstep_rollback::{Message, MessageBody, MessageRouter, ParticipantIndex, RollbackError};
///
/// let mut received = 0;
/// let mut router = MessageRouter::new();
/// router
///     .link(ParticipantIndex::new(1), |_msg: Message| -> Result<(), RollbackError> {
///         received += 1;
///         Ok(())
///     })
///     .unwrap();
///
/// let msg = Message {
///     from: ParticipantIndex::new(1),
///     sequence: 0,
///     magic: 0,
///     body: MessageBody::KeepAlive,
/// };
/// router.route(msg.clone()).unwrap();
///
/// let mut stranger = msg;
/// stranger.from = ParticipantIndex::new(2);
/// assert!(matches!(router.route(stranger), Err(RollbackError::UnroutedSender { .. })));
///
/// drop(router);
/// assert_eq!(received, 1);
/// ```
pub struct MessageRouter<H> {
    handlers: BTreeMap<ParticipantIndex, H>,
}

impl<H> std::fmt::Debug for MessageRouter<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("linked", &self.handlers.keys())
            .finish()
    }
}

impl<H> Default for MessageRouter<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> MessageRouter<H> {
    /// Creates a router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registers `handler` for envelopes sent by `index`.
    ///
    /// # Errors
    /// Returns [`RollbackError::AlreadyLinked`] if a handler is already registered for `index`.
    /// The existing handler is kept.
    pub fn link(&mut self, index: ParticipantIndex, handler: H) -> Result<(), RollbackError> {
        if self.handlers.contains_key(&index) {
            return Err(RollbackError::AlreadyLinked { index });
        }
        self.handlers.insert(index, handler);
        Ok(())
    }

    /// Removes and returns the handler registered for `index`.
    pub fn unlink(&mut self, index: ParticipantIndex) -> Option<H> {
        self.handlers.remove(&index)
    }

    /// `true` if a handler is registered for `index`.
    #[must_use]
    pub fn is_linked(&self, index: ParticipantIndex) -> bool {
        self.handlers.contains_key(&index)
    }

    /// The handler registered for `index`.
    #[must_use]
    pub fn get(&self, index: ParticipantIndex) -> Option<&H> {
        self.handlers.get(&index)
    }

    /// The handler registered for `index`, mutably.
    pub fn get_mut(&mut self, index: ParticipantIndex) -> Option<&mut H> {
        self.handlers.get_mut(&index)
    }

    /// Number of linked handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` if nothing is linked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Linked indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = ParticipantIndex> + '_ {
        self.handlers.keys().copied()
    }

    /// Linked handlers in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (ParticipantIndex, &H)> {
        self.handlers.iter().map(|(index, handler)| (*index, handler))
    }

    /// Linked handlers in ascending index order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParticipantIndex, &mut H)> {
        self.handlers
            .iter_mut()
            .map(|(index, handler)| (*index, handler))
    }
}

impl<H: MessageHandler> MessageRouter<H> {
    /// Dispatches `msg` to the handler registered for `msg.from`, synchronously.
    ///
    /// # Errors
    /// Returns [`RollbackError::UnroutedSender`] if nobody is linked for the sender,
    /// or whatever the handler returns.
    pub fn route(&mut self, msg: Message) -> Result<(), RollbackError> {
        let from = msg.from;
        match self.handlers.get_mut(&from) {
            Some(handler) => handler.on_message(msg),
            None => {
                trace!(%from, "no handler linked for sender");
                Err(RollbackError::UnroutedSender { from })
            },
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::MessageBody;
    use crate::Frame;

    fn msg_from(from: usize, body: MessageBody) -> Message {
        Message {
            from: ParticipantIndex::new(from),
            sequence: 0,
            magic: 0,
            body,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Message>,
    }

    impl MessageHandler for Recorder {
        fn on_message(&mut self, msg: Message) -> Result<(), RollbackError> {
            self.seen.push(msg);
            Ok(())
        }
    }

    #[test]
    fn routes_by_sender() {
        let mut router = MessageRouter::new();
        router.link(ParticipantIndex::new(1), Recorder::default()).unwrap();
        router.link(ParticipantIndex::new(2), Recorder::default()).unwrap();

        router.route(msg_from(2, MessageBody::KeepAlive)).unwrap();
        router
            .route(msg_from(
                1,
                MessageBody::InputAck {
                    ack_frame: Frame::new(3),
                },
            ))
            .unwrap();
        router.route(msg_from(2, MessageBody::FrameRequest)).unwrap();

        assert_eq!(router.get(ParticipantIndex::new(1)).unwrap().seen.len(), 1);
        let second = &router.get(ParticipantIndex::new(2)).unwrap().seen;
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].body, MessageBody::FrameRequest);
    }

    #[test]
    fn unknown_sender_is_unrouted() {
        let mut router: MessageRouter<Recorder> = MessageRouter::new();
        assert_eq!(
            router.route(msg_from(4, MessageBody::KeepAlive)),
            Err(RollbackError::UnroutedSender {
                from: ParticipantIndex::new(4)
            })
        );
    }

    #[test]
    fn link_twice_keeps_the_first_handler() {
        let mut router = MessageRouter::new();
        let mut first = Recorder::default();
        first.seen.push(msg_from(1, MessageBody::KeepAlive));
        router.link(ParticipantIndex::new(1), first).unwrap();

        let result = router.link(ParticipantIndex::new(1), Recorder::default());
        assert_eq!(
            result,
            Err(RollbackError::AlreadyLinked {
                index: ParticipantIndex::new(1)
            })
        );
        assert_eq!(router.get(ParticipantIndex::new(1)).unwrap().seen.len(), 1);
    }

    #[test]
    fn unlink_stops_routing() {
        let mut router = MessageRouter::new();
        router.link(ParticipantIndex::new(0), Recorder::default()).unwrap();
        assert!(router.is_linked(ParticipantIndex::new(0)));

        let handler = router.unlink(ParticipantIndex::new(0)).unwrap();
        assert!(handler.seen.is_empty());
        assert!(router.is_empty());
        assert!(router.route(msg_from(0, MessageBody::KeepAlive)).is_err());
        assert!(router.unlink(ParticipantIndex::new(0)).is_none());
    }

    #[test]
    fn handler_errors_propagate() {
        let mut router = MessageRouter::new();
        router
            .link(ParticipantIndex::new(3), |msg: Message| {
                Err(RollbackError::StaleOrDuplicatePacket {
                    sequence: msg.sequence,
                    expected: 1,
                })
            })
            .unwrap();
        assert!(matches!(
            router.route(msg_from(3, MessageBody::KeepAlive)),
            Err(RollbackError::StaleOrDuplicatePacket { sequence: 0, .. })
        ));
    }

    #[test]
    fn iteration_is_in_index_order() {
        let mut router = MessageRouter::new();
        for index in [5, 1, 3] {
            router
                .link(ParticipantIndex::new(index), Recorder::default())
                .unwrap();
        }
        let indices: Vec<usize> = router.indices().map(ParticipantIndex::as_usize).collect();
        assert_eq!(indices, vec![1, 3, 5]);
        assert_eq!(router.iter_mut().count(), 3);
        assert_eq!(router.len(), 3);
    }
}
