//! Error types for the directory middle layer.
//!
//! Every failure path funnels into [`DirError`]; the protocol head only needs
//! [`DirError::result_code`] and the `Display` text to build its response.

use std::fmt;

/// Standard LDAP result codes returned to the protocol head.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The operation completed.
    Success,
    /// Generic server-side failure.
    OperationsError,
    /// Malformed request.
    ProtocolError,
    /// Time limit reached before the operation finished.
    TimeLimitExceeded,
    /// Attribute (value) to delete does not exist.
    NoSuchAttribute,
    /// Attribute type unknown to the schema.
    UndefinedAttributeType,
    /// Constraint on an attribute value violated.
    ConstraintViolation,
    /// Attribute value already exists.
    AttributeOrValueExists,
    /// Value does not match the attribute syntax.
    InvalidAttributeSyntax,
    /// Target entry does not exist.
    NoSuchObject,
    /// DN could not be parsed.
    InvalidDnSyntax,
    /// Bind credentials rejected.
    InvalidCredentials,
    /// Caller lacks the required right.
    InsufficientAccessRights,
    /// Server too busy to serve the request.
    Busy,
    /// Server is shutting down.
    Unavailable,
    /// Server refuses to perform the operation.
    UnwillingToPerform,
    /// Entry naming violates the DIT structure rules.
    NamingViolation,
    /// Entry content violates its object classes.
    ObjectClassViolation,
    /// Operation only allowed on leaf entries.
    NotAllowedOnNonLeaf,
    /// Entry with the same DN already exists.
    EntryAlreadyExists,
    /// Structural object class cannot be changed.
    ObjectClassModsProhibited,
    /// Anything else.
    Other,
}

impl ResultCode {
    /// Numeric LDAP result code (RFC 4511).
    pub fn as_u32(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::Other => 80,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u32())
    }
}

/// Error types for directory middle-layer operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirError {
    /// Caller is anonymous or its bind failed.
    #[error("not bound or authentication failed")]
    NotBound,

    /// Caller lacks the right needed for the operation.
    #[error("insufficient access: {0}")]
    InsufficientAccess(String),

    /// Server refuses the operation (read-only mode, policy, full scans...).
    #[error("unwilling to perform: {0}")]
    UnwillingToPerform(String),

    /// Request is structurally invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// DN could not be parsed or normalized.
    #[error("invalid DN syntax: {0}")]
    InvalidDn(String),

    /// Attribute type is not defined in the schema.
    #[error("undefined attribute type: {0}")]
    UndefinedType(String),

    /// Attribute value already exists in the attribute.
    #[error("attribute {attr}: type or value exists ({value})")]
    TypeOrValueExists {
        /// Attribute name.
        attr: String,
        /// Offending value.
        value: String,
    },

    /// Attribute or value being deleted does not exist.
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),

    /// Value failed syntax validation.
    #[error("invalid attribute syntax: {0}")]
    InvalidSyntax(String),

    /// A constraint on an attribute or value was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Entry violates its object class definitions.
    #[error("object class violation: {0}")]
    ObjectClassViolation(String),

    /// Structural object class may not be modified.
    #[error("object class modification prohibited: {0}")]
    ObjectClassModsProhibited(String),

    /// DIT structure rule rejected the entry placement.
    #[error("structure rule violation: {0}")]
    StructureViolation(String),

    /// Delete or rename attempted on an entry with children.
    #[error("operation not allowed on non-leaf entry {0}")]
    NotAllowedOnNonLeaf(String),

    /// Invalid credential data (password attribute handling).
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Target entry not found.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The backend could not find the requested entry.
    #[error("backend entry not found: {0}")]
    BackendEntryNotFound(String),

    /// The backend already holds an entry with this DN.
    #[error("backend entry already exists: {0}")]
    BackendEntryExists(String),

    /// The parent of the target entry does not exist.
    #[error("parent {parent} not found ({message})")]
    ParentNotFound {
        /// Normalized parent DN.
        parent: String,
        /// Backend diagnostic text.
        message: String,
    },

    /// Transient backend lock conflict; the transaction may be retried.
    #[error("backend deadlock: {0}")]
    BackendDeadlock(String),

    /// Deadlock retries exhausted.
    #[error("lock deadlock after {attempts} attempts")]
    LockDeadlock {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Any other backend failure, with the backend's own text.
    #[error("backend error: {0}")]
    Backend(String),

    /// The operation reached the commit stage without an assigned USN.
    #[error("operation has no USN assigned")]
    NoUsn,

    /// The operation already holds a USN.
    #[error("operation already holds USN {0}")]
    UsnAlreadyAssigned(u64),

    /// Waiting for the write-queue head timed out.
    #[error("write queue wait for USN {usn} timed out after {waited_ms}ms")]
    WriteTimeout {
        /// USN of the waiting operation.
        usn: u64,
        /// Time spent waiting.
        waited_ms: u64,
    },

    /// A plugin hook failed.
    #[error("plugin {hook} failed: {message}")]
    Plugin {
        /// Hook name.
        hook: &'static str,
        /// Failure text.
        message: String,
    },

    /// Paged-search cookie is unknown or expired.
    #[error("no paged search context for cookie {0}")]
    NoPagedSearchContext(String),

    /// Paged-search continuation does not match the original request.
    #[error("invalid paged search request: {0}")]
    InvalidPagedSearchRequest(String),

    /// Reading a page timed out.
    #[error("paged search read timed out")]
    PagedSearchTimeout,

    /// Filter string could not be parsed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Server is shutting down.
    #[error("server unavailable")]
    Unavailable,

    /// Encoding or decoding of a stored record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant broken inside the middle layer.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DirError {
    /// Maps the error onto the LDAP result code sent to clients.
    pub fn result_code(&self) -> ResultCode {
        match self {
            DirError::NotBound | DirError::InsufficientAccess(_) => {
                ResultCode::InsufficientAccessRights
            }
            DirError::UnwillingToPerform(_) => ResultCode::UnwillingToPerform,
            DirError::InvalidRequest(_) | DirError::InvalidPagedSearchRequest(_) => {
                ResultCode::ProtocolError
            }
            DirError::InvalidFilter(_) => ResultCode::ProtocolError,
            DirError::InvalidDn(_) => ResultCode::InvalidDnSyntax,
            DirError::UndefinedType(_) => ResultCode::UndefinedAttributeType,
            DirError::TypeOrValueExists { .. } => ResultCode::AttributeOrValueExists,
            DirError::NoSuchAttribute(_) => ResultCode::NoSuchAttribute,
            DirError::InvalidSyntax(_) => ResultCode::InvalidAttributeSyntax,
            DirError::ConstraintViolation(_) => ResultCode::ConstraintViolation,
            DirError::ObjectClassViolation(_) => ResultCode::ObjectClassViolation,
            DirError::ObjectClassModsProhibited(_) => ResultCode::ObjectClassModsProhibited,
            DirError::StructureViolation(_) => ResultCode::NamingViolation,
            DirError::NotAllowedOnNonLeaf(_) => ResultCode::NotAllowedOnNonLeaf,
            DirError::InvalidCredential(_) => ResultCode::InvalidCredentials,
            DirError::NoSuchObject(_)
            | DirError::BackendEntryNotFound(_)
            | DirError::ParentNotFound { .. } => ResultCode::NoSuchObject,
            DirError::BackendEntryExists(_) => ResultCode::EntryAlreadyExists,
            DirError::BackendDeadlock(_) | DirError::LockDeadlock { .. } => ResultCode::Busy,
            DirError::WriteTimeout { .. } => ResultCode::Busy,
            DirError::PagedSearchTimeout => ResultCode::TimeLimitExceeded,
            DirError::Unavailable => ResultCode::Unavailable,
            DirError::NoPagedSearchContext(_) => ResultCode::UnwillingToPerform,
            DirError::Plugin { .. } => ResultCode::Other,
            DirError::Backend(_)
            | DirError::NoUsn
            | DirError::UsnAlreadyAssigned(_)
            | DirError::Serialization(_)
            | DirError::Internal(_) => ResultCode::OperationsError,
        }
    }

    /// Returns true for the backend-transient error class that the
    /// transaction loop retries.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, DirError::BackendDeadlock(_))
    }

    /// Returns true for permission errors (never retried).
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            DirError::NotBound | DirError::InsufficientAccess(_) | DirError::UnwillingToPerform(_)
        )
    }

    /// Returns true for terminal backend errors.
    pub fn is_backend_terminal(&self) -> bool {
        matches!(
            self,
            DirError::BackendEntryNotFound(_)
                | DirError::BackendEntryExists(_)
                | DirError::ParentNotFound { .. }
                | DirError::Backend(_)
        )
    }

    /// Prefixes the error text with the pipeline step that failed, keeping
    /// the variant (and so the result code) intact.
    pub fn context(self, step: &str) -> DirError {
        match self {
            DirError::Backend(msg) => DirError::Backend(format!("{}: {}", step, msg)),
            DirError::BackendEntryNotFound(msg) => {
                DirError::BackendEntryNotFound(format!("{}: {}", step, msg))
            }
            DirError::BackendEntryExists(msg) => {
                DirError::BackendEntryExists(format!("{}: {}", step, msg))
            }
            other => other,
        }
    }
}

impl From<bincode::Error> for DirError {
    fn from(e: bincode::Error) -> Self {
        DirError::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DirError>;

/// Outcome of an operation as handed back to the protocol head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpResult {
    /// LDAP result code.
    pub code: ResultCode,
    /// Human readable message, empty on success.
    pub message: String,
}

impl OpResult {
    /// A successful result.
    pub fn success() -> Self {
        Self {
            code: ResultCode::Success,
            message: String::new(),
        }
    }

    /// Builds a result from an error.
    pub fn from_error(err: &DirError) -> Self {
        Self {
            code: err.result_code(),
            message: err.to_string(),
        }
    }

    /// Returns true when the result code is success.
    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}

impl Default for OpResult {
    fn default() -> Self {
        Self::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(DirError::NotBound.result_code(), ResultCode::InsufficientAccessRights);
        assert_eq!(
            DirError::NotAllowedOnNonLeaf("cn=a".into()).result_code().as_u32(),
            66
        );
        assert_eq!(
            DirError::LockDeadlock { attempts: 6 }.result_code(),
            ResultCode::Busy
        );
        assert_eq!(
            DirError::TypeOrValueExists {
                attr: "mail".into(),
                value: "a".into()
            }
            .result_code()
            .as_u32(),
            20
        );
    }

    #[test]
    fn test_classification() {
        assert!(DirError::BackendDeadlock("x".into()).is_deadlock());
        assert!(!DirError::LockDeadlock { attempts: 1 }.is_deadlock());
        assert!(DirError::NotBound.is_permission());
        assert!(DirError::BackendEntryExists("x".into()).is_backend_terminal());
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = DirError::Backend("disk full".into()).context("txn commit");
        match err {
            DirError::Backend(msg) => assert_eq!(msg, "txn commit: disk full"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_op_result_from_error() {
        let res = OpResult::from_error(&DirError::NoUsn);
        assert_eq!(res.code, ResultCode::OperationsError);
        assert!(!res.is_success());
        assert!(OpResult::default().is_success());
    }
}
