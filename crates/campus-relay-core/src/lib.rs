pub mod combined;
pub mod error;
pub mod identity;
pub mod records;
pub mod time;

pub use combined::{CombinedResult, Domain, DomainOutcomes, DomainResult};
pub use error::{RelayError, Result};
pub use identity::{
    CredentialDecoder, CredentialRequest, Identity, ObfuscatedPayloadDecoder, RawCredentials,
    extract_identity,
};
pub use records::{
    AssessmentRecord, AttendanceRecord, ExamPriority, ExamRecord, GradeRecord, Profile,
};
pub use crate::time::{Timestamp, now_utc};
