use crate::errors::{DbError, RequestAttemptError, WriteType};

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// Default retry policy - retries when there is a high chance that a retry might help.\
/// Each kind of error is retried at most once per request.
#[derive(Debug)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    /// Creates a new instance of [DefaultRetryPolicy].
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

/// Implementation of [RetrySession] for [DefaultRetryPolicy].
#[derive(Default)]
pub struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetrySession {
    fn new() -> DefaultRetrySession {
        DefaultRetrySession::default()
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        let RequestAttemptError::DbError(db_error, _) = request_info.error else {
            return RetryDecision::DontRetry;
        };
        match db_error {
            // Unavailable - the current host believes that not enough replicas
            // are alive to satisfy specified consistency requirements.
            // Maybe this host has network problems - try a different one.
            // Perform at most one retry - it's unlikely that two hosts
            // have network problems at the same time
            DbError::Unavailable { .. } => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // ReadTimeout - coordinator didn't receive enough replies in time.
            // Retry at most once and only if there were actually enough replies
            // to satisfy consistency but they were all just checksums (data_present == false).
            // A retried read is likely to pick replicas that answer with data.
            DbError::ReadTimeout {
                received,
                required,
                data_present,
                ..
            } => {
                if !self.was_read_timeout_retry && received >= required && !*data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Write timeout - coordinator didn't receive enough replies in time.
            // Retry at most once and only for BatchLog write.
            // Coordinator probably didn't detect the nodes as dead.
            // By the time we retry they should be detected as dead.
            DbError::WriteTimeout { write_type, .. } => {
                if !self.was_write_timeout_retry && *write_type == WriteType::BatchLog {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // In all other cases propagate the error to the user
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::new();
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{DbError, RequestAttemptError, WriteType};
    use crate::test_utils::setup_tracing;
    use cassandra_cql::Consistency;

    fn make_request_info(error: &RequestAttemptError, is_idempotent: bool) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::One,
        }
    }

    fn db_error(error: DbError) -> RequestAttemptError {
        RequestAttemptError::DbError(error, String::new())
    }

    #[test]
    fn default_policy_unavailable_tries_next_host_once() {
        setup_tracing();
        let error = db_error(DbError::Unavailable {
            consistency: Consistency::Two,
            required: 2,
            alive: 1,
        });
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::RetryNextHost(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );

        policy.reset();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::RetryNextHost(None)
        );
    }

    #[test]
    fn default_policy_read_timeout() {
        setup_tracing();
        // Enough responses and data_present == false - retry on the same host
        let enough_responses_no_data = db_error(DbError::ReadTimeout {
            consistency: Consistency::Two,
            received: 2,
            required: 2,
            data_present: false,
        });
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_no_data, false)),
            RetryDecision::RetrySameHost(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_no_data, false)),
            RetryDecision::DontRetry
        );

        // Enough responses but data_present == true - the coordinator got data
        // and timed out anyway, a retry would not help
        let enough_responses_with_data = db_error(DbError::ReadTimeout {
            consistency: Consistency::Two,
            received: 2,
            required: 2,
            data_present: true,
        });
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_with_data, true)),
            RetryDecision::DontRetry
        );

        // Not enough responses - don't retry
        let not_enough_responses = db_error(DbError::ReadTimeout {
            consistency: Consistency::Two,
            received: 1,
            required: 2,
            data_present: false,
        });
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&not_enough_responses, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_policy_write_timeout() {
        setup_tracing();
        let good_write_type = db_error(DbError::WriteTimeout {
            consistency: Consistency::Two,
            received: 1,
            required: 2,
            write_type: WriteType::BatchLog,
        });
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&good_write_type, false)),
            RetryDecision::RetrySameHost(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&good_write_type, false)),
            RetryDecision::DontRetry
        );

        let bad_write_type = db_error(DbError::WriteTimeout {
            consistency: Consistency::Two,
            received: 1,
            required: 2,
            write_type: WriteType::Simple,
        });
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&bad_write_type, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_policy_other_errors_are_not_retried() {
        setup_tracing();
        for error in [
            db_error(DbError::SyntaxError),
            db_error(DbError::Overloaded),
            RequestAttemptError::RequestTimeout(std::time::Duration::from_secs(1)),
        ] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, true)),
                RetryDecision::DontRetry
            );
        }
    }
}
