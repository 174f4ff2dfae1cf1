use crate::network::protocol::PeerHandle;
use crate::network::router::MessageRouter;
use crate::sessions::config::{ProtocolConfig, RollbackConfig, SyncConfig};
use crate::sessions::lockstep_session::LockstepSession;
use crate::sync_layer::SyncEngine;
use crate::telemetry::ViolationObserver;
use crate::{ParticipantIndex, RollbackError, Transport};

use std::sync::Arc;

const DEFAULT_PARTICIPANTS: usize = 2;

/// The [`SessionBuilder`] builds a [`LockstepSession`].
///
/// Set the number of participants and which one is local, adjust the configuration if
/// needed, then hand a [`Transport`] to [`start_session`](Self::start_session).
///
/// ```
/// use lockstep_rollback::{MailboxHub, ParticipantIndex, RollbackConfig, SessionBuilder};
///
/// let hub = MailboxHub::new(2);
/// let session = SessionBuilder::new()
///     .with_num_participants(2)?
///     .with_local_participant(ParticipantIndex::new(0))
///     .with_rollback_config(RollbackConfig::competitive())
///     .start_session(hub.transport(ParticipantIndex::new(0))?)?;
/// assert_eq!(session.num_participants(), 2);
/// # Ok::<(), lockstep_rollback::RollbackError>(())
/// ```
#[derive(Clone)]
#[must_use = "SessionBuilder must be consumed by calling start_session"]
pub struct SessionBuilder {
    num_participants: usize,
    local: Option<ParticipantIndex>,
    rollback_config: RollbackConfig,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("num_participants", &self.num_participants)
            .field("local", &self.local)
            .field("rollback_config", &self.rollback_config)
            .field("sync_config", &self.sync_config)
            .field("protocol_config", &self.protocol_config)
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            num_participants: DEFAULT_PARTICIPANTS,
            local: None,
            rollback_config: RollbackConfig::default(),
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::default(),
            violation_observer: None,
        }
    }

    /// Change the number of participants. Default is 2.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if `num_participants` is 0.
    pub fn with_num_participants(mut self, num_participants: usize) -> Result<Self, RollbackError> {
        if num_participants == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "a session needs at least one participant".to_owned(),
            });
        }
        self.num_participants = num_participants;
        Ok(self)
    }

    /// Sets which participant this process controls. Every other index is treated as remote.
    pub fn with_local_participant(mut self, index: ParticipantIndex) -> Self {
        self.local = Some(index);
        self
    }

    /// Change the input delay of the local participant. Default is 0.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if the delay does not fit into the input queue.
    pub fn with_input_delay(mut self, delay: usize) -> Result<Self, RollbackError> {
        if delay >= self.rollback_config.queue_length {
            return Err(RollbackError::InvalidRequest {
                info: format!(
                    "input delay {} must be below the queue length {}",
                    delay, self.rollback_config.queue_length
                ),
            });
        }
        self.rollback_config.input_delay = delay;
        Ok(self)
    }

    /// Change the maximum prediction window. Default is 8.
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.rollback_config.max_prediction_frames = window;
        self
    }

    /// Change the simulation rate used for frame advantage estimates. Default is 60.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if `fps` is 0.
    pub fn with_fps(mut self, fps: usize) -> Result<Self, RollbackError> {
        if fps == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "fps must be greater than 0".to_owned(),
            });
        }
        self.rollback_config.fps = fps;
        Ok(self)
    }

    /// Replaces the whole rollback configuration.
    pub fn with_rollback_config(mut self, rollback_config: RollbackConfig) -> Self {
        self.rollback_config = rollback_config;
        self
    }

    /// Sets the handshake and retry timing.
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Sets quality reporting, timeouts and protocol randomness.
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Routes the violations the session detects to `observer` instead of `tracing`.
    ///
    /// ```
    /// use lockstep_rollback::telemetry::CollectingObserver;
    /// use lockstep_rollback::{MailboxHub, ParticipantIndex, SessionBuilder};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let hub = MailboxHub::new(2);
    /// let session = SessionBuilder::new()
    ///     .with_local_participant(ParticipantIndex::new(0))
    ///     .with_violation_observer(observer.clone())
    ///     .start_session(hub.transport(ParticipantIndex::new(0))?)?;
    /// assert!(session.violation_observer().is_some());
    /// assert!(observer.is_empty());
    /// # Ok::<(), lockstep_rollback::RollbackError>(())
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder and starts synchronizing with every remote participant.
    ///
    /// # Errors
    /// - [`RollbackError::InvalidRequest`] if no local participant was set or a configuration is invalid.
    /// - [`RollbackError::InvalidParticipant`] if the local participant is out of range.
    pub fn start_session<T: Transport>(
        self,
        transport: T,
    ) -> Result<LockstepSession<T>, RollbackError> {
        let local = self.local.ok_or_else(|| RollbackError::InvalidRequest {
            info: "no local participant set; call with_local_participant".to_owned(),
        })?;
        if !local.is_valid_for(self.num_participants) {
            return Err(RollbackError::InvalidParticipant {
                index: local,
                count: self.num_participants,
            });
        }

        self.rollback_config.validate()?;
        self.sync_config.validate()?;
        self.protocol_config.validate()?;

        let mut engine = SyncEngine::with_queue_length(
            self.num_participants,
            self.rollback_config.max_prediction_frames,
            self.rollback_config.queue_length,
        )?;
        engine.set_frame_delay(local.as_usize(), self.rollback_config.input_delay)?;

        let mut router = MessageRouter::new();
        for index in (0..self.num_participants).map(ParticipantIndex::new) {
            if index == local {
                continue;
            }
            router.link(
                index,
                PeerHandle::new(
                    local,
                    index,
                    self.sync_config,
                    self.protocol_config,
                    self.rollback_config.fps,
                ),
            )?;
        }

        Ok(LockstepSession::new(
            local,
            engine,
            router,
            transport,
            self.sync_config,
            self.violation_observer,
        ))
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
    use crate::network::mailbox::MailboxHub;
    use crate::SessionState;

    fn transport(hub: &MailboxHub, index: usize) -> crate::MailboxTransport {
        hub.transport(ParticipantIndex::new(index)).unwrap()
    }

    #[test]
    fn zero_participants_rejected() {
        assert!(SessionBuilder::new().with_num_participants(0).is_err());
    }

    #[test]
    fn missing_local_participant_rejected() {
        let hub = MailboxHub::new(2);
        let result = SessionBuilder::new().start_session(transport(&hub, 0));
        assert!(matches!(result, Err(RollbackError::InvalidRequest { .. })));
    }

    #[test]
    fn local_participant_out_of_range_rejected() {
        let hub = MailboxHub::new(3);
        let result = SessionBuilder::new()
            .with_local_participant(ParticipantIndex::new(2))
            .start_session(transport(&hub, 2));
        assert_eq!(
            result.err(),
            Some(RollbackError::InvalidParticipant {
                index: ParticipantIndex::new(2),
                count: 2
            })
        );
    }

    #[test]
    fn input_delay_must_fit_queue() {
        assert!(SessionBuilder::new().with_input_delay(127).is_ok());
        assert!(SessionBuilder::new().with_input_delay(128).is_err());
    }

    #[test]
    fn invalid_rollback_config_rejected() {
        let hub = MailboxHub::new(2);
        let result = SessionBuilder::new()
            .with_local_participant(ParticipantIndex::new(0))
            .with_max_prediction_window(0)
            .start_session(transport(&hub, 0));
        assert!(matches!(result, Err(RollbackError::InvalidRequest { .. })));
    }

    #[test]
    fn zero_fps_rejected() {
        assert!(SessionBuilder::new().with_fps(0).is_err());
        assert!(SessionBuilder::new().with_fps(30).is_ok());
    }

    #[test]
    fn single_participant_session_runs_immediately() {
        let hub = MailboxHub::new(1);
        let session = SessionBuilder::new()
            .with_num_participants(1)
            .unwrap()
            .with_local_participant(ParticipantIndex::new(0))
            .start_session(transport(&hub, 0))
            .unwrap();
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn remote_participants_start_synchronizing() {
        let hub = MailboxHub::new(3);
        let session = SessionBuilder::new()
            .with_num_participants(3)
            .unwrap()
            .with_local_participant(ParticipantIndex::new(1))
            .start_session(transport(&hub, 1))
            .unwrap();
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        assert_eq!(
            session.remote_participants(),
            vec![ParticipantIndex::new(0), ParticipantIndex::new(2)]
        );
    }
}
