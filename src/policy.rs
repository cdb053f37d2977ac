use serde_json::Value;

use crate::error::{GetError, GetFailure, LoadError};

/// Shapes how `get` translates a source's internal `{ok, _}`/`{error, _}`
/// outcome into a caller-observable result.
///
/// All three policies agree on successful reads and disagree only on
/// failure shape: `RaiseOnError` panics with a [`GetFailure`],
/// `ReturnNilOnError` collapses the failure to `Value::Null`, and
/// `Tuples` passes the error through as `Err`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GetPolicy {
    #[default]
    RaiseOnError,
    ReturnNilOnError,
    Tuples,
}

impl GetPolicy {
    pub(crate) fn apply(self, outcome: Result<Value, LoadError>) -> Result<Value, GetError> {
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => match self {
                GetPolicy::Tuples => Err(GetError::Load(error)),
                GetPolicy::ReturnNilOnError => Ok(Value::Null),
                GetPolicy::RaiseOnError => panic!("{}", GetFailure(error)),
            },
        }
    }
}
