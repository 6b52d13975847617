use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{LazyLock, Mutex},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

static GENERATOR: LazyLock<Mutex<ulid::Generator>> =
    LazyLock::new(|| Mutex::new(ulid::Generator::new()));

/// Identifier for a stored work item or notice batch
///
/// A ULID that doubles as the on-disk filename. Ids minted by one process are
/// strictly increasing, so sorting by id reproduces insertion order even when
/// two items share a millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    id: ulid::Ulid,
}

impl ItemId {
    /// Parse an id from a filename like `01ARYZ6S41TSV4RRFFQ69G5FAV.bin`
    ///
    /// Rejects path separators, `..` and anything that is not a ULID.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(".bin")?;
        let id = ulid::Ulid::from_string(stem).ok()?;

        Some(Self { id })
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Generate a new id, monotonic within this process
    #[must_use]
    pub fn generate() -> Self {
        let id = GENERATOR
            .lock()
            .ok()
            .and_then(|mut generator| generator.generate().ok())
            .unwrap_or_else(ulid::Ulid::new);

        Self { id }
    }

    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}.bin", self.id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.id.to_string())
    }
}

impl FromStr for ItemId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl Serialize for ItemId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Scheduling tier of a mail item
///
/// `Deferred` is not a tier the scheduler drains: items land there after a
/// transient failure and stay until promoted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
    Deferred = 4,
}

impl Priority {
    /// Tiers in the order the scheduler visits them
    pub const SCHEDULED: [Self; 3] = [Self::High, Self::Medium, Self::Low];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Deferred => "deferred",
        }
    }

    #[must_use]
    pub const fn is_scheduled(self) -> bool {
        !matches!(self, Self::Deferred)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" | "1" => Ok(Self::High),
            "medium" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            "deferred" | "4" => Ok(Self::Deferred),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// A message as handed over by a producer, before it is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to_address: String,
    pub from_address: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingMessage {
    pub fn new(
        to_address: impl Into<String>,
        from_address: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            to_address: to_address.into(),
            from_address: from_address.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// A stored mail work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: ItemId,
    pub to_address: String,
    pub from_address: String,
    pub subject: String,
    pub body: String,
    pub enqueued_at: SystemTime,
    pub priority: Priority,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(message: OutgoingMessage, priority: Priority, enqueued_at: SystemTime) -> Self {
        Self {
            id: ItemId::generate(),
            to_address: message.to_address,
            from_address: message.from_address,
            subject: message.subject,
            body: message.body,
            enqueued_at,
            priority,
        }
    }

    /// Scheduling key: oldest first, ties broken by insertion order
    #[must_use]
    pub fn order_key(&self) -> (SystemTime, &ItemId) {
        (self.enqueued_at, &self.id)
    }
}

/// Identifier of a notice recipient in the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a notice batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub recipient: UserId,
    pub label: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub on_site: bool,
}

/// A stored digest batch; `payload` holds the encoded notice list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeBatch {
    pub id: ItemId,
    pub created_at: SystemTime,
    pub payload: Vec<u8>,
}

impl NoticeBatch {
    #[must_use]
    pub fn order_key(&self) -> (SystemTime, &ItemId) {
        (self.created_at, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub address: String,
    pub added_at: SystemTime,
}

/// Outcome recorded for one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptResult {
    Success,
    Suppressed,
    Failure,
}

impl AttemptResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Suppressed => "Suppressed",
            Self::Failure => "Failure",
        }
    }
}

impl fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AttemptResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "suppressed" => Ok(Self::Suppressed),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown attempt result '{other}'")),
        }
    }
}

/// Permanent record of one attempt, with the item as it looked afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub message: QueuedMessage,
    pub attempted_at: SystemTime,
    pub result: AttemptResult,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_filename_validation() {
        assert!(ItemId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5FAV.bin").is_some());

        assert!(ItemId::from_filename("../etc/passwd.bin").is_none());
        assert!(ItemId::from_filename("foo/bar.bin").is_none());
        assert!(ItemId::from_filename("..\\windows\\system32.bin").is_none());
        assert!(ItemId::from_filename("not_a_valid_ulid.bin").is_none());
        assert!(ItemId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5FAV.eml").is_none());
        assert!(ItemId::from_filename(".tmp_01ARZ3NDEKTSV4RRFFQ69G5FAV.bin").is_none());
    }

    #[test]
    fn generated_ids_increase() {
        let ids: Vec<_> = (0..64).map(|_| ItemId::generate()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn priority_ordering_and_parsing() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Low < Priority::Deferred);
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!("LOW".parse::<Priority>(), Ok(Priority::Low));
        assert_eq!("1".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
        assert!(!Priority::Deferred.is_scheduled());
    }
}
