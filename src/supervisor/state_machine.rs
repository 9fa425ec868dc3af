use thiserror::Error;

/// Lifecycle state of one managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disabled,
    Starting,
    /// Process alive, last probe failed or not yet performed.
    Unhealthy,
    /// Process alive and answering its health endpoint.
    Healthy,
    Restarting,
    /// Restart budget exhausted; terminal until re-enabled.
    Failed,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Disabled }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &State) -> bool {
        // Administrative disable is allowed from every state.
        if *to == State::Disabled {
            return true;
        }
        matches!(
            (&self.state, to),
            (State::Disabled, State::Starting)
                | (State::Starting, State::Unhealthy)
                | (State::Starting, State::Failed)
                | (State::Unhealthy, State::Healthy)
                | (State::Unhealthy, State::Restarting)
                | (State::Unhealthy, State::Failed)
                | (State::Healthy, State::Unhealthy)
                | (State::Healthy, State::Restarting)
                | (State::Healthy, State::Failed)
                | (State::Restarting, State::Starting)
                | (State::Restarting, State::Failed)
                // Manual re-enable of a failed service.
                | (State::Failed, State::Starting)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    /// Force a state without validation. Used when reconciling observed
    /// reality (a process found dead) rather than driving a change.
    pub fn force(&mut self, to: State) {
        if self.state != to {
            tracing::debug!("State reconciled: {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }
}
