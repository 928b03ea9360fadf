//! Error types for relorm

use thiserror::Error;

/// Result type alias for relorm operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for statement compilation, planning, and execution.
///
/// All compile/plan-time variants are raised before any statement text is
/// handed to a driver, so a caller never observes a partially-sent statement
/// from this layer.
#[derive(Debug, Error)]
pub enum OrmError {
    /// A selected/filtered/ordered column's owning table is not part of the
    /// query's FROM/JOIN set. Usually signals a missing join.
    #[error("dangling column reference '{field}': table '{table}' is not part of the query")]
    DanglingColumnReference { field: String, table: String },

    /// A statement would select zero columns. Refused rather than guessing
    /// `SELECT *`.
    #[error("empty projection: '{table}' resolves to zero selected columns")]
    EmptyProjection { table: String },

    /// A set operation (union/intersect/except) was requested with no
    /// operands.
    #[error("set operation requires at least one operand")]
    EmptySetOperatorList,

    /// Operands of a set operation do not expose the same selected-field keys
    /// in the same order.
    #[error("set operation operands have mismatched shapes: [{left}] vs [{right}]")]
    MismatchedSetOperatorShape { left: String, right: String },

    /// A selection spec requested a relation that is not declared in the
    /// schema.
    #[error("unknown relation '{relation}' on table '{table}'")]
    UnknownRelation { relation: String, table: String },

    /// User-initiated rollback signal inside a transaction callback. A normal
    /// control path, not a bug; caught at the `transaction!` call site.
    #[error("transaction rolled back")]
    TransactionRollback,

    /// Validation error (malformed identifiers, unsupported dialect feature,
    /// misshapen configs)
    #[error("validation error: {0}")]
    Validation(String),

    /// Row value decode/mapping error
    #[error("decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// Opaque driver-level error; never interpreted by this layer
    #[error("driver error: {0}")]
    Driver(String),

    /// Migration bookkeeping error
    #[error("migration error: {0}")]
    Migration(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a dangling-reference error for a field path
    pub fn dangling(field: impl Into<String>, table: impl Into<String>) -> Self {
        Self::DanglingColumnReference {
            field: field.into(),
            table: table.into(),
        }
    }

    /// Check if this is the rollback control signal
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::TransactionRollback)
    }

    /// Check if this is a dangling column reference
    pub fn is_dangling_reference(&self) -> bool {
        matches!(self, Self::DanglingColumnReference { .. })
    }
}
