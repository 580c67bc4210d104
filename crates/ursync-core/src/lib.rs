//! Core domain model and identity resolution for ursync.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ursync-core";

/// Opaque identifier assigned to a user by the upstream registry.
///
/// Accepted on the wire as either a JSON string or a JSON integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self(text),
            Raw::Signed(n) => Self(n.to_string()),
            Raw::Unsigned(n) => Self(n.to_string()),
        })
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Inbound user record as delivered by a webhook or the upstream registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(rename = "id_usuario", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    #[serde(rename = "nombre", default)]
    pub given_name: Option<String>,
    #[serde(rename = "apellido_paterno", default, deserialize_with = "null_as_empty")]
    pub paternal_surname: String,
    #[serde(rename = "apellido_materno", default, deserialize_with = "null_as_empty")]
    pub maternal_surname: String,
    #[serde(rename = "fono", default, deserialize_with = "null_as_empty")]
    pub phone: String,
}

impl CandidateRecord {
    pub fn new(
        given_name: impl Into<String>,
        paternal_surname: impl Into<String>,
        maternal_surname: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            external_id: None,
            given_name: Some(given_name.into()),
            paternal_surname: paternal_surname.into(),
            maternal_surname: maternal_surname.into(),
            phone: phone.into(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(ExternalId::new(external_id));
        self
    }
}

/// Identity tuple used when no external identifier is available.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonTuple {
    pub given_name: String,
    pub paternal_surname: String,
    pub maternal_surname: String,
    pub phone: String,
}

/// Logical identity of a user; two candidates with equal keys are the same user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdentityKey {
    External(ExternalId),
    Tuple(PersonTuple),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External(id) => write!(f, "id_usuario={id}"),
            Self::Tuple(t) => write!(
                f,
                "{}|{}|{}|{}",
                t.given_name, t.paternal_surname, t.maternal_surname, t.phone
            ),
        }
    }
}

/// Candidate after canonicalization; the only shape the stores accept for insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub external_id: Option<ExternalId>,
    pub given_name: String,
    pub paternal_surname: String,
    pub maternal_surname: String,
    pub phone: String,
}

impl NormalizedRecord {
    pub fn identity_key(&self) -> IdentityKey {
        match &self.external_id {
            Some(id) => IdentityKey::External(id.clone()),
            None => IdentityKey::Tuple(self.tuple()),
        }
    }

    pub fn tuple(&self) -> PersonTuple {
        PersonTuple {
            given_name: self.given_name.clone(),
            paternal_surname: self.paternal_surname.clone(),
            maternal_surname: self.maternal_surname.clone(),
            phone: self.phone.clone(),
        }
    }
}

impl fmt::Display for NormalizedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.given_name)
    }
}

/// Persisted canonical user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalUser {
    pub id: i64,
    pub external_id: Option<ExternalId>,
    pub given_name: String,
    pub paternal_surname: String,
    pub maternal_surname: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}

impl CanonicalUser {
    pub fn identity_key(&self) -> IdentityKey {
        match &self.external_id {
            Some(id) => IdentityKey::External(id.clone()),
            None => IdentityKey::Tuple(PersonTuple {
                given_name: self.given_name.clone(),
                paternal_surname: self.paternal_surname.clone(),
                maternal_surname: self.maternal_surname.clone(),
                phone: self.phone.clone(),
            }),
        }
    }
}

/// Journal entry written by the audit sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    StoreError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::StoreError => "store_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of reconciling one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Inserted,
    SkippedDuplicate,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `nombre`")]
    MissingGivenName,
}

/// A batch element that could not be read as a [`CandidateRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed user record: {0}")]
pub struct MalformedRecord(pub String);

/// One position of an inbound batch, which may have been rejected before resolution.
pub type CandidateSlot = Result<CandidateRecord, MalformedRecord>;

/// Read one JSON element as a candidate. Wrong field types reject only this element.
pub fn candidate_from_value(value: serde_json::Value) -> CandidateSlot {
    serde_json::from_value(value).map_err(|err| MalformedRecord(err.to_string()))
}

/// Read every element of a JSON array, keeping input order.
pub fn candidates_from_values(values: Vec<serde_json::Value>) -> Vec<CandidateSlot> {
    values.into_iter().map(candidate_from_value).collect()
}

/// Upper-cases a given name. Applying it to its own output is a no-op.
pub fn canonicalize_given_name(raw: &str) -> String {
    raw.to_uppercase()
}

/// Normalize a candidate and derive its identity.
///
/// A blank external identifier is treated as absent, so the tuple rule applies.
pub fn resolve(candidate: &CandidateRecord) -> Result<NormalizedRecord, ValidationError> {
    let given_name = candidate
        .given_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .ok_or(ValidationError::MissingGivenName)?;

    Ok(NormalizedRecord {
        external_id: candidate.external_id.clone().filter(|id| !id.is_blank()),
        given_name: canonicalize_given_name(given_name),
        paternal_surname: candidate.paternal_surname.clone(),
        maternal_surname: candidate.maternal_surname.clone(),
        phone: candidate.phone.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_name_is_upper_cased() {
        let record = resolve(&CandidateRecord::new("ana", "lopez", "diaz", "555")).unwrap();
        assert_eq!(record.given_name, "ANA");
        assert_eq!(record.paternal_surname, "lopez");
        assert_eq!(record.maternal_surname, "diaz");
        assert_eq!(record.phone, "555");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in ["ana", "José María", "straße", "ÑANDÚ", "o'neil"] {
            let once = canonicalize_given_name(raw);
            assert_eq!(canonicalize_given_name(&once), once, "input {raw:?}");
        }

        let first = resolve(&CandidateRecord::new("ana", "lopez", "diaz", "555")).unwrap();
        let again = resolve(&CandidateRecord::new(
            first.given_name.clone(),
            "lopez",
            "diaz",
            "555",
        ))
        .unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn identity_prefers_external_id() {
        let record =
            resolve(&CandidateRecord::new("ana", "lopez", "diaz", "555").with_external_id("42"))
                .unwrap();
        assert_eq!(
            record.identity_key(),
            IdentityKey::External(ExternalId::new("42"))
        );
    }

    #[test]
    fn identity_falls_back_to_tuple() {
        let lower = resolve(&CandidateRecord::new("ana", "lopez", "diaz", "555")).unwrap();
        let upper = resolve(&CandidateRecord::new("ANA", "lopez", "diaz", "555")).unwrap();
        let other_phone = resolve(&CandidateRecord::new("ana", "lopez", "diaz", "556")).unwrap();

        assert_eq!(lower.identity_key(), upper.identity_key());
        assert_ne!(lower.identity_key(), other_phone.identity_key());
        assert!(matches!(lower.identity_key(), IdentityKey::Tuple(_)));
    }

    #[test]
    fn blank_external_id_uses_tuple_rule() {
        let record =
            resolve(&CandidateRecord::new("ana", "lopez", "diaz", "555").with_external_id("  "))
                .unwrap();
        assert!(record.external_id.is_none());
        assert!(matches!(record.identity_key(), IdentityKey::Tuple(_)));
    }

    #[test]
    fn missing_or_blank_given_name_is_rejected() {
        let mut candidate = CandidateRecord::new("x", "lopez", "diaz", "555");
        candidate.given_name = None;
        assert_eq!(resolve(&candidate), Err(ValidationError::MissingGivenName));

        candidate.given_name = Some("   ".into());
        assert_eq!(resolve(&candidate), Err(ValidationError::MissingGivenName));
    }

    #[test]
    fn wire_format_accepts_numeric_ids_and_nulls() {
        let json = r#"[
            {"id_usuario": 7, "nombre": "ana", "apellido_paterno": "lopez", "apellido_materno": null, "fono": "555"},
            {"id_usuario": "u-8", "nombre": "luis", "apellido_paterno": "soto", "apellido_materno": "rey", "fono": "777"},
            {"apellido_paterno": "soto"}
        ]"#;
        let records: Vec<CandidateRecord> = serde_json::from_str(json).unwrap();

        assert_eq!(records[0].external_id, Some(ExternalId::new("7")));
        assert_eq!(records[0].maternal_surname, "");
        assert_eq!(records[1].external_id, Some(ExternalId::new("u-8")));
        assert_eq!(records[2].given_name, None);
        assert_eq!(records[2].phone, "");
    }

    #[test]
    fn mistyped_elements_are_rejected_individually() {
        let values: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"nombre": "ana", "apellido_paterno": "lopez", "apellido_materno": "diaz", "fono": "555"},
                {"nombre": 7, "apellido_paterno": "lopez"},
                {"nombre": "luis", "fono": 555},
                {"id_usuario": true, "nombre": "rosa"},
                "not an object"
            ]"#,
        )
        .unwrap();
        let slots = candidates_from_values(values);

        assert_eq!(slots.len(), 5);
        assert_eq!(slots[0], Ok(CandidateRecord::new("ana", "lopez", "diaz", "555")));
        for slot in &slots[1..] {
            let err = slot.as_ref().unwrap_err();
            assert!(err.to_string().starts_with("malformed user record"), "{err}");
        }
    }

    #[test]
    fn failure_reason_strings() {
        assert_eq!(FailureReason::Validation.as_str(), "validation");
        assert_eq!(FailureReason::StoreError.as_str(), "store_error");
    }
}
