//! Captured per-node errors and how to compare them.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tandem_dispatch::Wire;
use tandem_dispatch::codec::{self, CodecError};

use crate::event::Phase;

/// XA error code: the transaction was heuristically rolled back.
pub const XA_HEURRB: i32 = 6;
/// XA error code: the transaction was heuristically committed.
pub const XA_HEURCOM: i32 = 7;
/// XA error code: the transaction was partly committed, partly rolled back.
pub const XA_HEURMIX: i32 = 5;
/// XA error code: the transaction may have been heuristically completed.
pub const XA_HEURHAZ: i32 = 8;

/// The family of errors an invocation can raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExceptionType {
    /// Errors from ordinary statements and connections.
    Sql,
    /// Errors from distributed transaction branches.
    Xa,
}

impl ExceptionType {
    /// The classifier for this family.
    #[must_use]
    pub fn classifier(self) -> &'static dyn ExceptionClassifier {
        match self {
            Self::Sql => &SqlClassifier,
            Self::Xa => &XaClassifier,
        }
    }

    pub(crate) const fn tag(self) -> u8 {
        match self {
            Self::Sql => 0,
            Self::Xa => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Sql),
            1 => Ok(Self::Xa),
            tag => Err(CodecError::InvalidTag {
                what: "exception type",
                tag,
            }),
        }
    }
}

/// An error returned by a node, captured as data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedError {
    /// Family of the error.
    pub exception_type: ExceptionType,
    /// Vendor or XA error code.
    pub code: i32,
    /// Five character SQL state, if the node reported one.
    pub sql_state: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl CapturedError {
    /// An SQL error.
    pub fn sql(code: i32, sql_state: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            exception_type: ExceptionType::Sql,
            code,
            sql_state: sql_state.map(str::to_string),
            message: message.into(),
        }
    }

    /// An XA error.
    pub fn xa(code: i32, message: impl Into<String>) -> Self {
        Self {
            exception_type: ExceptionType::Xa,
            code,
            sql_state: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "[{state}/{}] {}", self.code, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl std::error::Error for CapturedError {}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
impl Wire for CapturedError {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.exception_type.tag());
        buf.put_u32(self.code as u32);
        self.sql_state.encode(buf);
        codec::put_string(buf, &self.message);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            exception_type: ExceptionType::from_tag(codec::get_u8(buf)?)?,
            code: codec::get_u32(buf)? as i32,
            sql_state: Option::<String>::decode(buf)?,
            message: codec::get_string(buf)?,
        })
    }
}

/// Decides how errors of one family compare during recovery.
pub trait ExceptionClassifier: Send + Sync {
    /// Whether two nodes that failed with `a` and `b` ended in the same state.
    fn equivalent(&self, a: &CapturedError, b: &CapturedError) -> bool;

    /// Whether `error`, raised during `phase`, reports that the node reached
    /// the outcome `phase` asked for anyway.
    fn corrects_heuristic(&self, error: &CapturedError, phase: Phase) -> bool;
}

struct SqlClassifier;

impl ExceptionClassifier for SqlClassifier {
    fn equivalent(&self, a: &CapturedError, b: &CapturedError) -> bool {
        match (&a.sql_state, &b.sql_state) {
            (Some(left), Some(right)) => left == right,
            _ => a.code == b.code,
        }
    }

    fn corrects_heuristic(&self, _error: &CapturedError, _phase: Phase) -> bool {
        false
    }
}

struct XaClassifier;

impl ExceptionClassifier for XaClassifier {
    fn equivalent(&self, a: &CapturedError, b: &CapturedError) -> bool {
        a.code == b.code
    }

    fn corrects_heuristic(&self, error: &CapturedError, phase: Phase) -> bool {
        match error.code {
            XA_HEURCOM => phase == Phase::Commit,
            XA_HEURRB => phase == Phase::Rollback,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_equivalence_prefers_state() {
        let classifier = ExceptionType::Sql.classifier();
        let a = CapturedError::sql(1062, Some("23000"), "duplicate key");
        let b = CapturedError::sql(2627, Some("23000"), "violation of unique key");
        let c = CapturedError::sql(1062, None, "duplicate key");

        assert!(classifier.equivalent(&a, &b));
        assert!(classifier.equivalent(&a, &c));
        assert!(!classifier.equivalent(&b, &c));
    }

    #[test]
    fn test_xa_heuristic_outcomes() {
        let classifier = ExceptionType::Xa.classifier();
        let committed = CapturedError::xa(XA_HEURCOM, "heuristic commit");
        let mixed = CapturedError::xa(XA_HEURMIX, "heuristic mixed");

        assert!(classifier.corrects_heuristic(&committed, Phase::Commit));
        assert!(!classifier.corrects_heuristic(&committed, Phase::Rollback));
        assert!(!classifier.corrects_heuristic(&mixed, Phase::Commit));
        assert!(
            !ExceptionType::Sql
                .classifier()
                .corrects_heuristic(&committed, Phase::Commit)
        );
    }

    #[test]
    fn test_negative_code_survives_encoding() {
        let error = CapturedError::xa(-4, "invalid xid");
        assert_eq!(CapturedError::from_bytes(error.to_bytes()).unwrap(), error);
    }
}
