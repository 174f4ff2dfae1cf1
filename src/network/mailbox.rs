//! In-process transport.
//!
//! A [`MailboxHub`] owns one inbox per participant. Each [`MailboxTransport`] created from it
//! delivers envelopes straight into the destination's inbox and reads from its own. The inboxes
//! sit behind `parking_lot` mutexes, so transports can live on different threads.

use crate::network::messages::Message;
use crate::{ParticipantIndex, RollbackError, Transport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

type Inbox = Mutex<VecDeque<Message>>;

/// Shared set of inboxes, one per participant.
///
/// ```
/// use lockstep_rollback::{MailboxHub, Message, MessageBody, ParticipantIndex, Transport};
///
/// let hub = MailboxHub::new(2);
/// let mut a = hub.transport(ParticipantIndex::new(0)).unwrap();
/// let mut b = hub.transport(ParticipantIndex::new(1)).unwrap();
///
/// let msg = Message {
///     from: ParticipantIndex::new(0),
///     sequence: 0,
///     magic: 0,
///     body: MessageBody::KeepAlive,
/// };
/// a.send_to(&msg, ParticipantIndex::new(1));
/// assert_eq!(b.recv(), Some(msg));
/// assert_eq!(a.recv(), None);
/// ```
#[derive(Debug, Clone)]
pub struct MailboxHub {
    inboxes: Arc<[Inbox]>,
}

impl MailboxHub {
    /// Creates a hub for `participants` participants.
    #[must_use]
    pub fn new(participants: usize) -> Self {
        let inboxes: Vec<Inbox> = (0..participants)
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();
        Self {
            inboxes: inboxes.into(),
        }
    }

    /// Number of inboxes.
    #[must_use]
    pub fn participants(&self) -> usize {
        self.inboxes.len()
    }

    /// Creates the transport used by participant `index`.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidParticipant`] if the hub has no inbox for `index`.
    pub fn transport(&self, index: ParticipantIndex) -> Result<MailboxTransport, RollbackError> {
        if !index.is_valid_for(self.inboxes.len()) {
            return Err(RollbackError::InvalidParticipant {
                index,
                count: self.inboxes.len(),
            });
        }
        Ok(MailboxTransport {
            local: index,
            inboxes: Arc::clone(&self.inboxes),
        })
    }

    /// Number of envelopes waiting in the inbox of `index`.
    #[must_use]
    pub fn pending(&self, index: ParticipantIndex) -> usize {
        self.inboxes
            .get(index.as_usize())
            .map_or(0, |inbox| inbox.lock().len())
    }
}

/// The endpoint of one participant on a [`MailboxHub`].
#[derive(Debug, Clone)]
pub struct MailboxTransport {
    local: ParticipantIndex,
    inboxes: Arc<[Inbox]>,
}

impl MailboxTransport {
    /// The participant whose inbox this transport reads.
    #[must_use]
    pub fn local_index(&self) -> ParticipantIndex {
        self.local
    }
}

impl Transport for MailboxTransport {
    fn send_to(&mut self, msg: &Message, to: ParticipantIndex) {
        match self.inboxes.get(to.as_usize()) {
            Some(inbox) => inbox.lock().push_back(msg.clone()),
            None => trace!(%to, "no inbox for destination; dropping message"),
        }
    }

    fn recv(&mut self) -> Option<Message> {
        self.inboxes
            .get(self.local.as_usize())
            .and_then(|inbox| inbox.lock().pop_front())
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

    fn keepalive(from: usize, sequence: u16) -> Message {
        Message {
            from: ParticipantIndex::new(from),
            sequence,
            magic: 0,
            body: MessageBody::KeepAlive,
        }
    }

    #[test]
    fn delivers_in_send_order() {
        let hub = MailboxHub::new(3);
        let mut a = hub.transport(ParticipantIndex::new(0)).unwrap();
        let mut c = hub.transport(ParticipantIndex::new(2)).unwrap();

        for sequence in 0..3 {
            a.send_to(&keepalive(0, sequence), ParticipantIndex::new(2));
        }
        assert_eq!(hub.pending(ParticipantIndex::new(2)), 3);
        assert_eq!(hub.pending(ParticipantIndex::new(1)), 0);

        let received: Vec<u16> = std::iter::from_fn(|| c.recv())
            .map(|msg| msg.sequence)
            .collect();
        assert_eq!(received, vec![0, 1, 2]);
        assert_eq!(c.recv(), None);
    }

    #[test]
    fn unknown_destination_is_dropped() {
        let hub = MailboxHub::new(1);
        let mut a = hub.transport(ParticipantIndex::new(0)).unwrap();
        a.send_to(&keepalive(0, 0), ParticipantIndex::new(5));
        assert_eq!(a.recv(), None);
    }

    #[test]
    fn transport_for_missing_participant_fails() {
        let hub = MailboxHub::new(2);
        assert_eq!(
            hub.transport(ParticipantIndex::new(2)).unwrap_err(),
            RollbackError::InvalidParticipant {
                index: ParticipantIndex::new(2),
                count: 2
            }
        );
    }

    #[test]
    fn transports_work_across_threads() {
        let hub = MailboxHub::new(2);
        let mut sender = hub.transport(ParticipantIndex::new(0)).unwrap();
        let mut receiver = hub.transport(ParticipantIndex::new(1)).unwrap();

        let handle = std::thread::spawn(move || {
            for sequence in 0..10 {
                sender.send_to(&keepalive(0, sequence), ParticipantIndex::new(1));
            }
        });
        handle.join().unwrap();

        assert_eq!(std::iter::from_fn(|| receiver.recv()).count(), 10);
    }
}
