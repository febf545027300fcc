use cassandra_cql::Consistency;
use tracing::debug;

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::errors::{DbError, RequestAttemptError, WriteType};

/// Downgrading consistency retry policy - retries with lower consistency level if it knows\
/// that the initial CL is unreachable. Also, it behaves as [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy)
/// when it believes that the initial CL is reachable.
#[derive(Debug)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    /// Creates a new instance of [DowngradingConsistencyRetryPolicy].
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

impl Default for DowngradingConsistencyRetryPolicy {
    fn default() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy::new()
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DowngradingConsistencyRetrySession::new())
    }
}

/// Implementation of [RetrySession] for [DowngradingConsistencyRetryPolicy].
#[derive(Default)]
pub struct DowngradingConsistencyRetrySession {
    was_retry: bool,
}

impl DowngradingConsistencyRetrySession {
    fn new() -> DowngradingConsistencyRetrySession {
        DowngradingConsistencyRetrySession { was_retry: false }
    }
}

// The highest consistency that `known_ok` replicas can satisfy.
fn max_likely_to_work_cl(previous_cl: Consistency, required: i32, known_ok: i32) -> RetryDecision {
    let decision = if previous_cl == Consistency::All && required > 1 && known_ok > required / 2 {
        RetryDecision::RetrySameHost(Some(Consistency::Quorum))
    } else if known_ok >= 3 {
        RetryDecision::RetrySameHost(Some(Consistency::Three))
    } else if known_ok == 2 {
        RetryDecision::RetrySameHost(Some(Consistency::Two))
    } else if known_ok == 1 {
        RetryDecision::RetrySameHost(Some(Consistency::One))
    } else {
        RetryDecision::DontRetry
    };
    if let RetryDecision::RetrySameHost(Some(new_cl)) = decision {
        debug!(
            "Decided to lower required consistency from {} to {}.",
            previous_cl, new_cl
        );
    }
    decision
}

impl RetrySession for DowngradingConsistencyRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        let RequestAttemptError::DbError(db_error, _) = request_info.error else {
            return RetryDecision::DontRetry;
        };
        if self.was_retry {
            return RetryDecision::DontRetry;
        }
        let cl = request_info.consistency;

        let decision = match db_error {
            DbError::Unavailable {
                required, alive, ..
            } => max_likely_to_work_cl(cl, *required, *alive),
            DbError::ReadTimeout {
                received,
                required,
                data_present,
                ..
            } => {
                if cl.is_serial() {
                    RetryDecision::DontRetry
                } else if received < required {
                    max_likely_to_work_cl(cl, *required, *received)
                } else if !*data_present {
                    RetryDecision::RetrySameHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            DbError::WriteTimeout {
                received,
                required,
                write_type,
                ..
            } => match write_type {
                // The write reached at least one replica, which will propagate it.
                WriteType::Simple | WriteType::Batch => RetryDecision::Ignore,
                WriteType::UnloggedBatch => max_likely_to_work_cl(cl, *required, *received),
                WriteType::BatchLog => RetryDecision::RetrySameHost(None),
                _ => RetryDecision::DontRetry,
            },
            _ => RetryDecision::DontRetry,
        };

        if matches!(decision, RetryDecision::RetrySameHost(_)) {
            self.was_retry = true;
        }
        decision
    }

    fn reset(&mut self) {
        *self = DowngradingConsistencyRetrySession::new();
    }
}
