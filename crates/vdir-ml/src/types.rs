use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Update sequence number stamped on every write.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Usn(u64);

impl Usn {
    /// The "not yet assigned" USN.
    pub const NONE: Usn = Usn(0);

    /// Creates a new Usn from a raw u64 value
    pub fn new(usn: u64) -> Self {
        Usn(usn)
    }

    /// Returns the raw u64 value of this USN
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this USN has been assigned
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Usn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-assigned entry identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Creates a new EntryId from a raw u64 value
    pub fn new(id: u64) -> Self {
        EntryId(id)
    }

    /// Returns the raw u64 value of this entry ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an operation came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpOrigin {
    /// A client request arriving through the protocol head.
    External,
    /// A system call made by the server itself (bootstrap, plugin side effects).
    Internal,
    /// A change received from a replication partner.
    Repl,
}

impl fmt::Display for OpOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpOrigin::External => write!(f, "external"),
            OpOrigin::Internal => write!(f, "internal"),
            OpOrigin::Repl => write!(f, "repl"),
        }
    }
}

/// Kind of directory operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Add a new entry.
    Add,
    /// Modify (or rename) an existing entry.
    Modify,
    /// Delete an entry.
    Delete,
    /// Search the directory.
    Search,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Add => write!(f, "add"),
            OpKind::Modify => write!(f, "modify"),
            OpKind::Delete => write!(f, "delete"),
            OpKind::Search => write!(f, "search"),
        }
    }
}

/// Search scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Only the base entry.
    Base,
    /// Direct children of the base.
    OneLevel,
    /// The base and everything below it.
    Subtree,
}

/// Well-known attribute and class names.
pub mod attr {
    /// objectClass
    pub const OBJECT_CLASS: &str = "objectclass";
    /// entryDN (internal DN attribute)
    pub const ENTRY_DN: &str = "entrydn";
    /// cn
    pub const CN: &str = "cn";
    /// usnCreated
    pub const USN_CREATED: &str = "usncreated";
    /// usnChanged
    pub const USN_CHANGED: &str = "usnchanged";
    /// createTimeStamp
    pub const CREATE_TIMESTAMP: &str = "createtimestamp";
    /// modifyTimeStamp
    pub const MODIFY_TIMESTAMP: &str = "modifytimestamp";
    /// creatorsName
    pub const CREATORS_NAME: &str = "creatorsname";
    /// modifiersName
    pub const MODIFIERS_NAME: &str = "modifiersname";
    /// objectGUID
    pub const OBJECT_GUID: &str = "objectguid";
    /// objectSid
    pub const OBJECT_SID: &str = "objectsid";
    /// nTSecurityDescriptor
    pub const SECURITY_DESCRIPTOR: &str = "ntsecuritydescriptor";
    /// vmwAclString style ACL text
    pub const ACL_STRING: &str = "aclstring";
    /// isDeleted
    pub const IS_DELETED: &str = "isdeleted";
    /// lastKnownParent style original DN
    pub const LAST_KNOWN_DN: &str = "lastknowndn";
    /// memberOf
    pub const MEMBER_OF: &str = "memberof";
    /// member
    pub const MEMBER: &str = "member";
    /// userPassword
    pub const USER_PASSWORD: &str = "userpassword";
    /// groupType
    pub const GROUP_TYPE: &str = "grouptype";
    /// userPrincipalName
    pub const UPN: &str = "userprincipalname";
    /// servicePrincipalName
    pub const SPN: &str = "serviceprincipalname";
    /// domainFunctionalLevel
    pub const DOMAIN_FUNCTIONAL_LEVEL: &str = "domainfunctionallevel";
    /// Lockout policy: failed attempts before lockout
    pub const MAX_FAILED_ATTEMPTS: &str = "maxfailedattempts";
    /// Lockout policy: lockout duration in seconds
    pub const LOCKOUT_DURATION: &str = "lockoutduration";
    /// Lockout policy: window in seconds for counting failures
    pub const FAILED_ATTEMPT_WINDOW: &str = "failedattemptwindow";
    /// Per-account failed attempt counter
    pub const FAILED_ATTEMPTS: &str = "failedattempts";
    /// Index configuration: attribute being indexed
    pub const INDEX_ATTRIBUTE: &str = "indexattribute";
    /// Index configuration: global uniqueness flag
    pub const INDEX_UNIQUE: &str = "indexunique";
    /// Index configuration: current build state
    pub const INDEX_STATE: &str = "indexstate";
    /// Schema: attribute name defined by an attributeSchema entry
    pub const LDAP_DISPLAY_NAME: &str = "ldapdisplayname";
    /// Schema: attribute syntax
    pub const ATTRIBUTE_SYNTAX: &str = "attributesyntax";
    /// Schema: single-valued flag
    pub const IS_SINGLE_VALUED: &str = "issinglevalued";
    /// Schema: MUST attributes of a classSchema entry
    pub const MUST_CONTAIN: &str = "mustcontain";
    /// Schema: MAY attributes of a classSchema entry
    pub const MAY_CONTAIN: &str = "maycontain";
    /// Schema: allowed parent classes of a classSchema entry
    pub const POSS_SUPERIORS: &str = "posssuperiors";
    /// Replication agreement: partner URI
    pub const LABELED_URI: &str = "labeleduri";
    /// Replication agreement: last seen partner USN
    pub const LAST_LOCAL_USN_PROCESSED: &str = "lastlocalusnprocessed";
    /// Server: invocation id
    pub const INVOCATION_ID: &str = "invocationid";
    /// Server: numeric server id
    pub const SERVER_ID: &str = "serverid";
    /// Foreign security principal: referenced SID
    pub const FSP_SID: &str = "foreignsid";
    /// DC computer account password refresh marker
    pub const DC_ACCOUNT_PWD_REFRESH: &str = "pwdlastset";
}

/// Well-known object class names.
pub mod class {
    /// top
    pub const TOP: &str = "top";
    /// domain (dc= components)
    pub const DOMAIN: &str = "domain";
    /// organizationalUnit
    pub const OU: &str = "organizationalunit";
    /// container
    pub const CONTAINER: &str = "container";
    /// user
    pub const USER: &str = "user";
    /// group
    pub const GROUP: &str = "group";
    /// computer
    pub const COMPUTER: &str = "computer";
    /// foreignSecurityPrincipal
    pub const FSP: &str = "foreignsecurityprincipal";
    /// replicationAgreement
    pub const REPL_AGREEMENT: &str = "replicationagreement";
    /// server
    pub const SERVER: &str = "server";
    /// attributeSchema
    pub const ATTRIBUTE_SCHEMA: &str = "attributeschema";
    /// classSchema
    pub const CLASS_SCHEMA: &str = "classschema";
    /// indexConfig
    pub const INDEX_CONFIG: &str = "indexconfig";
    /// lockoutPolicy
    pub const LOCKOUT_POLICY: &str = "lockoutpolicy";
    /// Marker class added to tombstones
    pub const DELETED_OBJECT: &str = "deletedobject";
}

/// Formats a timestamp in LDAP generalized time (`YYYYMMDDHHMMSS.0Z`).
pub fn generalized_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%S.0Z").to_string()
}

/// Current time in generalized form.
pub fn now_generalized() -> String {
    generalized_time(Utc::now())
}

/// Parses a generalized time value produced by [`generalized_time`].
pub fn parse_generalized_time(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim_end_matches('Z');
    let core = trimmed.split('.').next()?;
    NaiveDateTime::parse_from_str(core, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
