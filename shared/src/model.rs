use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(EmergencyId);
typed_id!(ContactId);

impl EmergencyId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid coordinate: lat={0}, lon={1}")]
    InvalidCoordinate(String, String),
    #[error("safety timer duration must be greater than zero")]
    ZeroDuration,
    #[error("safety timer duration {requested_ms}ms exceeds maximum {max_ms}ms")]
    DurationTooLong { requested_ms: u64, max_ms: u64 },
    #[error("safety timer duration {requested_ms}ms is below minimum {min_ms}ms")]
    DurationTooShort { requested_ms: u64, min_ms: u64 },
    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
}

// --- Coordinate: validated, NaN-safe ---

#[derive(Copy, Clone, Serialize, Deserialize)]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ValidationError> {
        if !lat.is_finite()
            || !lon.is_finite()
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lon)
        {
            return Err(ValidationError::InvalidCoordinate(
                lat.to_string(),
                lon.to_string(),
            ));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub fn lat(&self) -> f64 {
        self.lat
    }

    #[must_use]
    pub fn lon(&self) -> f64 {
        self.lon
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.lat.to_bits() == other.lat.to_bits() && self.lon.to_bits() == other.lon.to_bits()
    }
}

impl Eq for Coordinate {}

// Coarsened to ~1km so logs never carry a precise position.
impl fmt::Debug for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coordinate(~{:.2}, ~{:.2})", self.lat, self.lon)
    }
}

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

// --- Bounded text ---

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct BoundedText<const MAX: usize>(String);

impl<const MAX: usize> BoundedText<MAX> {
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        if s.len() > MAX {
            return Err(ValidationError::TooLong {
                len: s.len(),
                max: MAX,
            });
        }
        Ok(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<const MAX: usize> TryFrom<String> for BoundedText<MAX> {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl<const MAX: usize> fmt::Debug for BoundedText<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED; {} bytes]", self.0.len())
    }
}

pub type Notes = BoundedText<4096>;

// --- Emergency kind ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmergencyKind {
    #[serde(rename = "SOS")]
    Sos,
    #[serde(rename = "Safety Timer")]
    SafetyTimer,
    #[serde(rename = "Manual")]
    Manual,
}

impl EmergencyKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Sos => "SOS",
            Self::SafetyTimer => "Safety Timer",
            Self::Manual => "Manual",
        }
    }
}

impl fmt::Display for EmergencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// --- Emergency record ---

/// One emergency episode, from activation to deactivation.
///
/// Fields are private: outside the crate a record is read-only. The engine is
/// the only writer and goes through the `pub(crate)` mutators below, which
/// keep `elapsed_ms` in lock-step with `active`.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct EmergencyRecord {
    id: EmergencyId,
    kind: EmergencyKind,
    started_at: UnixTimeMs,
    location: Option<Coordinate>,
    planned_duration_ms: Option<u64>,
    elapsed_ms: Option<u64>,
    active: bool,
    #[serde(default)]
    notified_contacts: Vec<ContactId>,
    #[serde(default)]
    media_recorded: bool,
    #[serde(default)]
    notes: Option<Notes>,
}

impl EmergencyRecord {
    /// `planned` is only kept for `SafetyTimer`.
    pub(crate) fn open(kind: EmergencyKind, started_at: UnixTimeMs, planned: Option<Duration>) -> Self {
        let planned_duration_ms = match kind {
            EmergencyKind::SafetyTimer => planned.map(duration_to_ms),
            EmergencyKind::Sos | EmergencyKind::Manual => None,
        };
        debug_assert!(
            kind != EmergencyKind::SafetyTimer || planned_duration_ms.is_some(),
            "safety timer record opened without a planned duration"
        );

        Self {
            id: EmergencyId::generate(),
            kind,
            started_at,
            location: None,
            planned_duration_ms,
            elapsed_ms: None,
            active: true,
            notified_contacts: Vec::new(),
            media_recorded: false,
            notes: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &EmergencyId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> EmergencyKind {
        self.kind
    }

    #[must_use]
    pub fn started_at(&self) -> UnixTimeMs {
        self.started_at
    }

    #[must_use]
    pub fn location(&self) -> Option<Coordinate> {
        self.location
    }

    #[must_use]
    pub fn planned_duration(&self) -> Option<Duration> {
        self.planned_duration_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn elapsed_duration(&self) -> Option<Duration> {
        self.elapsed_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn notified_contacts(&self) -> &[ContactId] {
        &self.notified_contacts
    }

    #[must_use]
    pub fn media_recorded(&self) -> bool {
        self.media_recorded
    }

    #[must_use]
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_ref().map(BoundedText::as_str)
    }

    #[must_use]
    pub fn snapshot(&self) -> EmergencySnapshot {
        EmergencySnapshot {
            id: self.id.clone(),
            kind: self.kind,
            started_at: self.started_at,
            location: self.location,
            planned_duration_ms: self.planned_duration_ms,
        }
    }

    /// Returns false if a location was already captured.
    pub(crate) fn set_location(&mut self, location: Coordinate) -> bool {
        if self.location.is_some() {
            return false;
        }
        self.location = Some(location);
        true
    }

    /// Returns false for a contact already on the list.
    pub(crate) fn push_contact(&mut self, contact: ContactId) -> bool {
        if self.notified_contacts.contains(&contact) {
            return false;
        }
        self.notified_contacts.push(contact);
        true
    }

    pub(crate) fn mark_media_recorded(&mut self) {
        self.media_recorded = true;
    }

    pub(crate) fn set_notes(&mut self, notes: Option<Notes>) {
        self.notes = notes;
    }

    /// Flips the record inactive. A second call keeps the first elapsed value.
    pub(crate) fn finalize(&mut self, elapsed: Duration) {
        if !self.active {
            return;
        }
        self.active = false;
        self.elapsed_ms = Some(duration_to_ms(elapsed));
    }

    /// Checks the per-record invariants; used by the store when loading.
    pub(crate) fn is_consistent(&self) -> bool {
        let elapsed_iff_inactive = self.elapsed_ms.is_some() != self.active;
        let planned_iff_timer =
            self.planned_duration_ms.is_some() == (self.kind == EmergencyKind::SafetyTimer);
        elapsed_iff_inactive && planned_iff_timer
    }
}

// Redact debug output because notes and location are sensitive user data.
impl fmt::Debug for EmergencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmergencyRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("started_at", &self.started_at)
            .field("location_present", &self.location.is_some())
            .field("planned_duration_ms", &self.planned_duration_ms)
            .field("elapsed_ms", &self.elapsed_ms)
            .field("active", &self.active)
            .field("notified_contacts", &self.notified_contacts.len())
            .field("media_recorded", &self.media_recorded)
            .field("notes_present", &self.notes.is_some())
            .finish()
    }
}

/// What the dispatcher gets to see about an episode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EmergencySnapshot {
    pub id: EmergencyId,
    pub kind: EmergencyKind,
    pub started_at: UnixTimeMs,
    pub location: Option<Coordinate>,
    pub planned_duration_ms: Option<u64>,
}

pub(crate) fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_rejects_nan() {
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(0.0, f64::NAN).is_err());
    }

    #[test]
    fn coordinate_rejects_out_of_range() {
        assert!(Coordinate::new(91.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, 181.0).is_err());
        assert!(Coordinate::new(-91.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, -181.0).is_err());
    }

    #[test]
    fn coordinate_accepts_valid() {
        assert!(Coordinate::new(55.7558, 37.6173).is_ok());
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert!(Coordinate::new(-90.0, -180.0).is_ok());
    }

    #[test]
    fn coordinate_debug_is_coarse() {
        let c = Coordinate::new(55.755_812, 37.617_311).unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("755812"));
        assert!(dbg.contains("55.76"));
    }

    #[test]
    fn planned_duration_only_for_safety_timer() {
        let sos = EmergencyRecord::open(
            EmergencyKind::Sos,
            UnixTimeMs(1_000),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(sos.planned_duration(), None);
        assert!(sos.is_consistent());

        let timer = EmergencyRecord::open(
            EmergencyKind::SafetyTimer,
            UnixTimeMs(1_000),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(timer.planned_duration(), Some(Duration::from_secs(5)));
        assert!(timer.is_consistent());
    }

    #[test]
    fn finalize_sets_elapsed_once() {
        let mut record = EmergencyRecord::open(EmergencyKind::Manual, UnixTimeMs(0), None);
        assert!(record.is_active());
        assert_eq!(record.elapsed_duration(), None);

        record.finalize(Duration::from_millis(2_000));
        assert!(!record.is_active());
        assert_eq!(record.elapsed_duration(), Some(Duration::from_secs(2)));

        record.finalize(Duration::from_millis(9_000));
        assert_eq!(record.elapsed_duration(), Some(Duration::from_secs(2)));
        assert!(record.is_consistent());
    }

    #[test]
    fn location_is_set_at_most_once() {
        let mut record = EmergencyRecord::open(EmergencyKind::Sos, UnixTimeMs(0), None);
        let first = Coordinate::new(1.0, 2.0).unwrap();
        let second = Coordinate::new(3.0, 4.0).unwrap();

        assert!(record.set_location(first));
        assert!(!record.set_location(second));
        assert_eq!(record.location(), Some(first));
    }

    #[test]
    fn contacts_append_in_order_without_duplicates() {
        let mut record = EmergencyRecord::open(EmergencyKind::Sos, UnixTimeMs(0), None);
        assert!(record.push_contact(ContactId::new("mom")));
        assert!(record.push_contact(ContactId::new("dad")));
        assert!(!record.push_contact(ContactId::new("mom")));

        let ids: Vec<&str> = record.notified_contacts().iter().map(ContactId::as_str).collect();
        assert_eq!(ids, vec!["mom", "dad"]);
    }

    #[test]
    fn record_debug_redacts_notes() {
        let mut record = EmergencyRecord::open(EmergencyKind::Manual, UnixTimeMs(0), None);
        record.set_notes(Some(Notes::new("walked home via the park").unwrap()));
        let dbg = format!("{record:?}");
        assert!(!dbg.contains("park"));
        assert!(dbg.contains("notes_present: true"));
    }

    #[test]
    fn bounded_text_enforces_limit() {
        assert!(BoundedText::<5>::new("hello").is_ok());
        assert!(BoundedText::<5>::new("toolong").is_err());
        assert!(serde_json::from_str::<BoundedText<5>>("\"toolong\"").is_err());
    }

    #[test]
    fn kind_serializes_with_stable_names() {
        let json = serde_json::to_string(&EmergencyKind::SafetyTimer).unwrap();
        assert_eq!(json, "\"Safety Timer\"");
        let back: EmergencyKind = serde_json::from_str("\"SOS\"").unwrap();
        assert_eq!(back, EmergencyKind::Sos);
    }

    #[test]
    fn typed_ids_are_not_interchangeable() {
        let emergency = EmergencyId::new("abc");
        let contact = ContactId::new("abc");
        assert_eq!(emergency.as_str(), contact.as_str());
    }
}
