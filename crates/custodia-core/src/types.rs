use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Timestamp: canonical time representation (seconds + nanoseconds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds_since_epoch: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        chrono::Utc::now().into()
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds_since_epoch: seconds,
            nanoseconds: 0,
        }
    }

    pub fn from_parts(seconds: u64, nanoseconds: u32) -> Self {
        Self {
            seconds_since_epoch: seconds,
            nanoseconds,
        }
    }

    /// Timestamp `days` whole days before this one, clamped at the epoch.
    pub fn days_before(&self, days: u64) -> Self {
        Self {
            seconds_since_epoch: self
                .seconds_since_epoch
                .saturating_sub(days.saturating_mul(86_400)),
            nanoseconds: self.nanoseconds,
        }
    }

    pub fn to_rfc3339(&self) -> String {
        let dt =
            chrono::DateTime::from_timestamp(self.seconds_since_epoch as i64, self.nanoseconds);
        dt.map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "invalid".to_string())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            seconds_since_epoch: dt.timestamp().max(0) as u64,
            nanoseconds: dt.timestamp_subsec_nanos(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed identifiers: prevent stringly-typed confusion
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(UserId, "Identifier of a data owner, supplied by the session layer.");
define_id!(ClientId, "OAuth client identifier of a registered application.");
define_id!(RecordId, "Opaque identifier of a ledger entry.");
define_id!(ConsentId, "Opaque identifier of a consent record.");
define_id!(ScopeName, "Name of a scope an application may request.");

fn random_hex_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl RecordId {
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

impl ConsentId {
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

// ---------------------------------------------------------------------------
// ScopeSet: ordered, deduplicated scope names
// ---------------------------------------------------------------------------

/// An ordered set of scope names. First occurrence wins on duplicates.
///
/// Deserializes from a list or from an OAuth scope string; always
/// serializes as a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "ScopeSetRepr", into = "Vec<ScopeName>")]
pub struct ScopeSet {
    entries: Vec<ScopeName>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopeSetRepr {
    List(Vec<ScopeName>),
    Spaced(String),
}

impl From<ScopeSetRepr> for ScopeSet {
    fn from(repr: ScopeSetRepr) -> Self {
        match repr {
            ScopeSetRepr::List(list) => Self::new(list),
            ScopeSetRepr::Spaced(raw) => Self::parse(&raw),
        }
    }
}

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScopeName>,
    {
        let mut entries: Vec<ScopeName> = Vec::new();
        for scope in scopes {
            let scope = scope.into();
            if !entries.contains(&scope) {
                entries.push(scope);
            }
        }
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse an OAuth-style scope string. Whitespace and commas both separate.
    pub fn parse(raw: &str) -> Self {
        Self::new(
            raw.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScopeName> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, scope: &ScopeName) -> bool {
        self.entries.contains(scope)
    }

    /// Entries of `self` absent from `other`, in order.
    pub fn difference(&self, other: &ScopeSet) -> ScopeSet {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|s| !other.contains(s))
                .cloned()
                .collect(),
        }
    }

    pub fn push(&mut self, scope: ScopeName) {
        if !self.entries.contains(&scope) {
            self.entries.push(scope);
        }
    }

    /// Space-separated rendering, the inverse of `parse`.
    pub fn to_scope_string(&self) -> String {
        self.entries
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<Vec<ScopeName>> for ScopeSet {
    fn from(v: Vec<ScopeName>) -> Self {
        Self::new(v)
    }
}

impl From<ScopeSet> for Vec<ScopeName> {
    fn from(s: ScopeSet) -> Self {
        s.entries
    }
}

impl<'a> IntoIterator for &'a ScopeSet {
    type Item = &'a ScopeName;
    type IntoIter = std::slice::Iter<'a, ScopeName>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// AttributeType: the kinds of personal data the ledger holds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttributeType {
    LegalId,
    Email,
    Phone,
    LegalNameFirst,
    LegalNameLast,
    BirthDate,
    Nationality,
    MaritalStatus,
    Address,
    Gender,
    Profession,
    Income,
    JobTitle,
}

impl AttributeType {
    pub const ALL: [AttributeType; 13] = [
        AttributeType::LegalId,
        AttributeType::Email,
        AttributeType::Phone,
        AttributeType::LegalNameFirst,
        AttributeType::LegalNameLast,
        AttributeType::BirthDate,
        AttributeType::Nationality,
        AttributeType::MaritalStatus,
        AttributeType::Address,
        AttributeType::Gender,
        AttributeType::Profession,
        AttributeType::Income,
        AttributeType::JobTitle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::LegalId => "legal-id",
            AttributeType::Email => "email",
            AttributeType::Phone => "phone",
            AttributeType::LegalNameFirst => "legal-name-first",
            AttributeType::LegalNameLast => "legal-name-last",
            AttributeType::BirthDate => "birth-date",
            AttributeType::Nationality => "nationality",
            AttributeType::MaritalStatus => "marital-status",
            AttributeType::Address => "address",
            AttributeType::Gender => "gender",
            AttributeType::Profession => "profession",
            AttributeType::Income => "income",
            AttributeType::JobTitle => "job-title",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision: three-valued consent state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The user reached the prompt but has not answered yet.
    Pending,
    Granted,
    Denied,
}

impl Decision {
    pub fn from_accept(accept: bool) -> Self {
        if accept {
            Decision::Granted
        } else {
            Decision::Denied
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Granted => "granted",
            Decision::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Decision::Pending),
            "granted" => Some(Decision::Granted),
            "denied" => Some(Decision::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Session: what the identity provider tells us about the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Option<UserId>,
}

impl Session {
    pub fn authenticated(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// AuditHash: hash of an audit entry (for chain integrity)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditHash(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl fmt::Display for AuditHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

mod hex_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}
