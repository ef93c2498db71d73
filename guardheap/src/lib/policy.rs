//! When the backend refuses a request, the heap does not give up right
//! away. It asks its [`ExceptionPolicy`] what to do next.
//!
//! The policy is a small, total state machine. [`PolicyState::CallHandler`]
//! runs a user-supplied handler whose answer is itself a [`PolicyState`],
//! so a handler may e.g. drop some caches and answer
//! [`PolicyState::Retry`]. Be careful not to go into an infinite loop.
use crate::utils::{fmt, HeapError};

/// The numeric values match the classic `MEM_*` constants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PolicyState {
    /// Print `Fatal error: out of memory` and exit. The default.
    #[default]
    AbortWithMessage    = 0,
    /// Exit without a word.
    AbortSilently       = 1,
    /// Let the caller see [`HeapError::OutOfMemory`].
    ReturnNull          = 2,
    /// Ask the handler.
    CallHandler         = 3,
    /// Try the backend once more.
    Retry               = 4,
}

impl TryFrom<i32> for PolicyState {
    type Error = HeapError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0   => Ok(PolicyState::AbortWithMessage),
            1   => Ok(PolicyState::AbortSilently),
            2   => Ok(PolicyState::ReturnNull),
            3   => Ok(PolicyState::CallHandler),
            4   => Ok(PolicyState::Retry),
            _   => Err(HeapError::Configuration("unknown exception policy")),
        }
    }
}

/// What the allocation surface must do after an escalation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Ask the backend again.
    Retry,
    /// Fail the request with [`HeapError::OutOfMemory`].
    ReturnNull,
    /// Stop the process, printing the fatal message first if `announce`.
    Abort { announce: bool },
}

pub type Handler = Box<dyn FnMut() -> PolicyState + Send>;

pub const MISSING_HANDLER: &str = "CallHandler policy selected without a handler";

pub struct ExceptionPolicy<H = Handler> {
    state:      PolicyState,
    handler:    Option<H>,
}

impl<H> Default for ExceptionPolicy<H> {
    fn default() -> Self {
        Self {
            state:      PolicyState::default(),
            handler:    None,
        }
    }
}

impl<H> fmt::Debug for ExceptionPolicy<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("state", &self.state)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl<H> ExceptionPolicy<H>
where
    H: FnMut() -> PolicyState,
{
    /// The handler is only kept when `state` is
    /// [`PolicyState::CallHandler`], and is mandatory in that case.
    pub fn new(state: PolicyState, handler: Option<H>) -> Result<Self, HeapError> {
        let handler = match state {
            PolicyState::CallHandler    => {
                Some(handler.ok_or(HeapError::Configuration(MISSING_HANDLER))?)
            },
            _                           => None,
        };

        Ok(Self { state, handler })
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Runs the state machine until it settles on a [`Verdict`]. Handlers
    /// are invoked as many times as they keep answering
    /// [`PolicyState::CallHandler`].
    pub fn escalate(&mut self) -> Result<Verdict, HeapError> {
        let mut state = self.state;
        loop {
            match state {
                PolicyState::AbortWithMessage   => break Ok(Verdict::Abort { announce: true }),
                PolicyState::AbortSilently      => break Ok(Verdict::Abort { announce: false }),
                PolicyState::ReturnNull         => break Ok(Verdict::ReturnNull),
                PolicyState::Retry              => break Ok(Verdict::Retry),
                PolicyState::CallHandler        => {
                    let handler = self
                        .handler
                        .as_mut()
                        .ok_or(HeapError::Configuration(MISSING_HANDLER))?;
                    state = handler();
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_states_settle_immediately() {
        let cases = [
            (PolicyState::AbortWithMessage, Verdict::Abort { announce: true }),
            (PolicyState::AbortSilently, Verdict::Abort { announce: false }),
            (PolicyState::ReturnNull, Verdict::ReturnNull),
            (PolicyState::Retry, Verdict::Retry),
        ];
        for (state, verdict) in cases {
            let mut policy = ExceptionPolicy::<Handler>::new(state, None).unwrap();
            assert_eq!(policy.escalate(), Ok(verdict));
        }
    }

    #[test]
    fn default_aborts_loudly() {
        let mut policy = ExceptionPolicy::<Handler>::default();
        assert_eq!(policy.state(), PolicyState::AbortWithMessage);
        assert_eq!(policy.escalate(), Ok(Verdict::Abort { announce: true }));
    }

    #[test]
    fn handler_is_mandatory() {
        let res = ExceptionPolicy::<Handler>::new(PolicyState::CallHandler, None);
        assert!(matches!(res, Err(HeapError::Configuration(_))));
    }

    #[test]
    fn handler_answers_are_chained() {
        let mut answers = vec![PolicyState::ReturnNull, PolicyState::CallHandler, PolicyState::CallHandler];
        let mut calls = 0;
        let handler = || {
            calls += 1;
            answers.pop().unwrap()
        };
        let mut policy = ExceptionPolicy::new(PolicyState::CallHandler, Some(handler)).unwrap();
        assert_eq!(policy.escalate(), Ok(Verdict::ReturnNull));
        drop(policy);
        assert_eq!(calls, 3);
    }

    #[test]
    fn handler_dropped_for_other_states() {
        let policy = ExceptionPolicy::new(PolicyState::Retry, Some(|| PolicyState::ReturnNull)).unwrap();
        assert!(!format!("{policy:?}").contains("handler: true"));
    }

    #[test]
    fn raw_values_round_trip_classic_constants() {
        for raw in 0..=4 {
            assert_eq!(PolicyState::try_from(raw).unwrap() as i32, raw);
        }
        assert!(PolicyState::try_from(5).is_err());
    }
}
