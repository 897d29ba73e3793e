//! Device registration and fingerprint validation engine.
//!
//! Owns the registration lifecycle and the drift decision table:
//! - `register` creates the (employee, device) row
//! - `validate_fingerprint` scores a presented fingerprint against the
//!   stored hash and decides ALLOW / ALLOW-AND-LOG / REQUIRE-MFA / BLOCK
//! - `check_registration` is the approved-device lookup used by login
//! - admin transitions drive the approval state machine
//!
//! State machine: `pending → approved` (admin approve), `pending →
//! blocked` (admin reject), `approved → drift` (automatic on major
//! drift), `drift → approved` (admin re-approve), `approved|drift →
//! blocked` (admin block). `blocked` is terminal except for a fresh
//! registration after operator intervention.
//!
//! All dependencies are injected at construction; the engine holds no
//! global state and adds no per-employee lock — the store's UNIQUE
//! constraints are the only coordination, so concurrent callers must
//! treat `DuplicateRegistration` as a normal race outcome.

use crate::audit::{
    AccessLogEntry, AccessResult, AuditLog, SecurityEvent, SecurityEventKind, Severity,
};
use crate::error::{EngineError, StoreError};
use crate::fingerprint::FingerprintHasher;
use crate::store::{SqlParams, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Similarity above this (exclusive) is minor drift: allow and log.
const MINOR_DRIFT_THRESHOLD: f64 = 0.8;

/// Similarity above this (exclusive) but at or below the minor threshold
/// is major drift: hold for MFA. At or below, it is a mismatch.
const MAJOR_DRIFT_THRESHOLD: f64 = 0.6;

/// Security score decay per outcome. The score floors at zero.
const SCORE_DECAY_MINOR_DRIFT: i64 = 5;
const SCORE_DECAY_MAJOR_DRIFT: i64 = 20;
const SCORE_DECAY_MISMATCH: i64 = 30;

/// Lifecycle state of a device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Blocked,
    Drift,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Blocked => "blocked",
            Self::Drift => "drift",
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "blocked" => Ok(Self::Blocked),
            "drift" => Ok(Self::Drift),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

/// Caller-supplied request context (origin IP, user agent).
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Input to [`RegistrationEngine::register`].
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub employee_id: String,
    pub full_name: String,
    pub device_id: String,
    /// Raw fingerprint string from the collector; hashed before storage,
    /// never persisted in plaintext.
    pub fingerprint: String,
    pub context: AccessContext,
}

/// Successful registration outcome.
#[derive(Debug, Clone, Copy)]
pub struct Registered {
    pub registration_id: i64,
    pub status: DeviceStatus,
}

/// A device registration row.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub id: i64,
    pub employee_id: String,
    pub full_name: String,
    pub device_id: String,
    pub fingerprint_hash: String,
    pub status: DeviceStatus,
    pub registration_ip: Option<String>,
    pub user_agent: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub security_score: i64,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_reason: Option<String>,
}

/// Why a validation produced its verdict. String forms are the wire
/// vocabulary consumed by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    FingerprintMatch,
    MinorDrift,
    MajorDrift,
    FingerprintMismatch,
    DeviceNotRegistered,
    DeviceNotApproved,
}

impl ValidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FingerprintMatch => "FINGERPRINT_MATCH",
            Self::MinorDrift => "MINOR_DRIFT",
            Self::MajorDrift => "MAJOR_DRIFT",
            Self::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            Self::DeviceNotRegistered => "DEVICE_NOT_REGISTERED",
            Self::DeviceNotApproved => "DEVICE_NOT_APPROVED",
        }
    }
}

/// Verdict of one fingerprint validation. A policy outcome, not an
/// error: the caller decides UX (prompt MFA, route to registration).
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub reason: ValidationReason,
    /// Populated for drift/mismatch verdicts.
    pub similarity: Option<f64>,
    pub requires_mfa: bool,
    /// Current status, populated for `DEVICE_NOT_APPROVED`.
    pub status: Option<DeviceStatus>,
}

impl ValidationReport {
    fn verdict(valid: bool, reason: ValidationReason) -> Self {
        Self {
            valid,
            reason,
            similarity: None,
            requires_mfa: false,
            status: None,
        }
    }
}

/// The registration engine. Dependencies are explicit; clones share the
/// same store and audit trail.
#[derive(Clone)]
pub struct RegistrationEngine {
    store: Arc<Store>,
    hasher: FingerprintHasher,
    audit: AuditLog,
    auto_approve: bool,
}

impl RegistrationEngine {
    pub fn new(
        store: Arc<Store>,
        hasher: FingerprintHasher,
        audit: AuditLog,
        auto_approve: bool,
    ) -> Self {
        Self {
            store,
            hasher,
            audit,
            auto_approve,
        }
    }

    /// Register a device for an employee.
    ///
    /// The row starts `pending` (or `approved` under the auto-approve
    /// policy). A unique-constraint violation on employee or device maps
    /// to [`EngineError::DuplicateRegistration`] — an expected race under
    /// concurrent registration, not a fatal failure.
    pub async fn register(&self, request: RegistrationRequest) -> Result<Registered, EngineError> {
        require("employee_id", &request.employee_id)?;
        require("full_name", &request.full_name)?;
        require("device_id", &request.device_id)?;
        require("fingerprint", &request.fingerprint)?;

        let fingerprint_hash = self.hasher.hash(&request.fingerprint);
        let status = if self.auto_approve {
            DeviceStatus::Approved
        } else {
            DeviceStatus::Pending
        };
        let now = Utc::now().to_rfc3339();

        let params: SqlParams = vec![
            request.employee_id.clone().into(),
            request.full_name.clone().into(),
            request.device_id.clone().into(),
            fingerprint_hash.clone().into(),
            status.as_str().to_string().into(),
            request.context.ip_address.clone().into(),
            request.context.user_agent.clone().into(),
            now.clone().into(),
            now.clone().into(),
            now.into(),
        ];
        let inserted = self
            .store
            .run(
                "INSERT INTO device_registrations
                    (employee_id, full_name, device_id, fingerprint_hash, status,
                     registration_ip, user_agent, registered_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params,
            )
            .await;

        let inserted = match inserted {
            Ok(result) => result,
            Err(e) if EngineError::is_constraint_violation(&e) => {
                return Err(EngineError::DuplicateRegistration);
            }
            Err(e) => return Err(e.into()),
        };

        self.audit
            .log_security_event(SecurityEvent {
                kind: SecurityEventKind::DeviceRegistered,
                severity: Severity::Medium,
                employee_id: Some(request.employee_id.clone()),
                description: format!("Device registered for {}", request.full_name),
                details: Some(serde_json::json!({
                    "device_id": request.device_id,
                    "fingerprint_hash": &fingerprint_hash[..16],
                })),
                ip_address: request.context.ip_address.clone(),
            })
            .await?;

        tracing::info!(
            employee_id = %request.employee_id,
            device_id = %request.device_id,
            status = status.as_str(),
            "device registered"
        );

        Ok(Registered {
            registration_id: inserted.last_insert_rowid,
            status,
        })
    }

    /// Validate a presented fingerprint against the stored hash and apply
    /// the drift decision table. Always appends exactly one access log
    /// row, written after the verdict (and any row mutation) is final.
    pub async fn validate_fingerprint(
        &self,
        employee_id: &str,
        raw_fingerprint: &str,
        context: &AccessContext,
    ) -> Result<ValidationReport, EngineError> {
        require("employee_id", employee_id)?;
        require("fingerprint", raw_fingerprint)?;

        let presented = self.hasher.hash(raw_fingerprint);
        let row = self
            .store
            .get(
                "SELECT id, fingerprint_hash, status, security_score
                 FROM device_registrations
                 WHERE employee_id = ?1",
                vec![employee_id.to_string().into()],
                |row| {
                    let status: String = row.get(2)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        status,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .await?;

        let Some((row_id, stored_hash, status_raw, security_score)) = row else {
            self.log_attempt(
                employee_id,
                &presented,
                AccessResult::Pending,
                context,
                Some("device not registered"),
            )
            .await?;
            return Ok(ValidationReport::verdict(
                false,
                ValidationReason::DeviceNotRegistered,
            ));
        };

        let status = DeviceStatus::from_str(&status_raw).map_err(EngineError::Validation)?;
        if status != DeviceStatus::Approved {
            let result = if status == DeviceStatus::Blocked {
                AccessResult::Blocked
            } else {
                AccessResult::Pending
            };
            self.log_attempt(
                employee_id,
                &presented,
                result,
                context,
                Some("device not approved"),
            )
            .await?;
            let mut report =
                ValidationReport::verdict(false, ValidationReason::DeviceNotApproved);
            report.status = Some(status);
            return Ok(report);
        }

        if stored_hash == presented {
            self.touch_login(row_id, context, None).await?;
            self.log_attempt(employee_id, &presented, AccessResult::Success, context, None)
                .await?;
            return Ok(ValidationReport::verdict(
                true,
                ValidationReason::FingerprintMatch,
            ));
        }

        let similarity = FingerprintHasher::similarity(&stored_hash, &presented);
        if similarity > MINOR_DRIFT_THRESHOLD {
            let score = decayed(security_score, SCORE_DECAY_MINOR_DRIFT);
            self.touch_login(row_id, context, Some(score)).await?;
            self.audit
                .log_security_event(SecurityEvent {
                    kind: SecurityEventKind::FingerprintDrift,
                    severity: Severity::Low,
                    employee_id: Some(employee_id.to_string()),
                    description: format!(
                        "Minor device fingerprint drift detected ({:.1}% match)",
                        similarity * 100.0
                    ),
                    details: Some(serde_json::json!({
                        "similarity": similarity,
                        "action": "ALLOWED",
                    })),
                    ip_address: context.ip_address.clone(),
                })
                .await?;
            self.log_attempt(
                employee_id,
                &presented,
                AccessResult::Success,
                context,
                Some("minor fingerprint drift"),
            )
            .await?;
            let mut report = ValidationReport::verdict(true, ValidationReason::MinorDrift);
            report.similarity = Some(similarity);
            return Ok(report);
        }

        if similarity > MAJOR_DRIFT_THRESHOLD {
            let score = decayed(security_score, SCORE_DECAY_MAJOR_DRIFT);
            // Automatic approved -> drift transition; re-approval is an
            // admin decision.
            self.store
                .run(
                    "UPDATE device_registrations
                     SET status = 'drift', security_score = ?1, updated_at = ?2
                     WHERE id = ?3",
                    vec![score.into(), Utc::now().to_rfc3339().into(), row_id.into()],
                )
                .await?;
            self.audit
                .log_security_event(SecurityEvent {
                    kind: SecurityEventKind::FingerprintDrift,
                    severity: Severity::High,
                    employee_id: Some(employee_id.to_string()),
                    description: format!(
                        "Major device fingerprint drift detected ({:.1}% match)",
                        similarity * 100.0
                    ),
                    details: Some(serde_json::json!({
                        "similarity": similarity,
                        "action": "REQUIRE_MFA",
                    })),
                    ip_address: context.ip_address.clone(),
                })
                .await?;
            self.log_attempt(
                employee_id,
                &presented,
                AccessResult::DriftDetected,
                context,
                Some("major fingerprint drift, MFA required"),
            )
            .await?;
            tracing::warn!(
                employee_id,
                similarity,
                "major fingerprint drift, holding for MFA"
            );
            let mut report = ValidationReport::verdict(false, ValidationReason::MajorDrift);
            report.similarity = Some(similarity);
            report.requires_mfa = true;
            return Ok(report);
        }

        let score = decayed(security_score, SCORE_DECAY_MISMATCH);
        self.store
            .run(
                "UPDATE device_registrations
                 SET security_score = ?1, updated_at = ?2
                 WHERE id = ?3",
                vec![score.into(), Utc::now().to_rfc3339().into(), row_id.into()],
            )
            .await?;
        self.audit
            .log_security_event(SecurityEvent {
                kind: SecurityEventKind::FingerprintMismatch,
                severity: Severity::Critical,
                employee_id: Some(employee_id.to_string()),
                description: format!(
                    "Device fingerprint completely changed ({:.1}% match)",
                    similarity * 100.0
                ),
                details: Some(serde_json::json!({
                    "similarity": similarity,
                    "action": "BLOCKED",
                })),
                ip_address: context.ip_address.clone(),
            })
            .await?;
        self.log_attempt(
            employee_id,
            &presented,
            AccessResult::Blocked,
            context,
            Some("fingerprint mismatch"),
        )
        .await?;
        tracing::warn!(employee_id, similarity, "fingerprint mismatch, blocked");
        let mut report = ValidationReport::verdict(false, ValidationReason::FingerprintMismatch);
        report.similarity = Some(similarity);
        Ok(report)
    }

    /// Look up an approved registration for (employee, device).
    ///
    /// A hit also appends a `success` access log row: every check is
    /// itself evidence of access and must be auditable.
    pub async fn check_registration(
        &self,
        employee_id: &str,
        device_id: &str,
        context: &AccessContext,
    ) -> Result<Option<DeviceRegistration>, EngineError> {
        require("employee_id", employee_id)?;
        require("device_id", device_id)?;

        let registration = self
            .store
            .get(
                "SELECT id, employee_id, full_name, device_id, fingerprint_hash, status,
                        registration_ip, user_agent, registered_at, last_login_at,
                        last_login_ip, security_score, approved_by, approved_at,
                        approval_reason
                 FROM device_registrations
                 WHERE employee_id = ?1 AND device_id = ?2 AND status = 'approved'",
                vec![employee_id.to_string().into(), device_id.to_string().into()],
                map_registration_row,
            )
            .await?;

        if let Some(ref registration) = registration {
            self.log_attempt(
                employee_id,
                &registration.fingerprint_hash,
                AccessResult::Success,
                context,
                Some("registration check"),
            )
            .await?;
        }
        Ok(registration)
    }

    // ── Admin state machine transitions ─────────────────────────────

    /// `pending|drift -> approved`. Returns false when the row was not
    /// in an approvable state (already processed by a concurrent admin).
    pub async fn approve_device(
        &self,
        registration_id: i64,
        admin_id: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        self.transition(
            registration_id,
            admin_id,
            reason,
            DeviceStatus::Approved,
            &[DeviceStatus::Pending, DeviceStatus::Drift],
        )
        .await
    }

    /// `pending -> blocked` (admin rejection of a registration request).
    pub async fn reject_device(
        &self,
        registration_id: i64,
        admin_id: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        self.transition(
            registration_id,
            admin_id,
            reason,
            DeviceStatus::Blocked,
            &[DeviceStatus::Pending],
        )
        .await
    }

    /// `approved|drift -> blocked`. Terminal except for a fresh
    /// registration after operator intervention.
    pub async fn block_device(
        &self,
        registration_id: i64,
        admin_id: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        self.transition(
            registration_id,
            admin_id,
            reason,
            DeviceStatus::Blocked,
            &[DeviceStatus::Approved, DeviceStatus::Drift],
        )
        .await
    }

    async fn transition(
        &self,
        registration_id: i64,
        admin_id: &str,
        reason: &str,
        to: DeviceStatus,
        from: &[DeviceStatus],
    ) -> Result<bool, EngineError> {
        let guard = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let now = Utc::now().to_rfc3339();
        let result = self
            .store
            .run(
                &format!(
                    "UPDATE device_registrations
                     SET status = ?1, approved_by = ?2, approved_at = ?3,
                         approval_reason = ?4, updated_at = ?5
                     WHERE id = ?6 AND status IN ({guard})"
                ),
                vec![
                    to.as_str().to_string().into(),
                    admin_id.to_string().into(),
                    now.clone().into(),
                    reason.to_string().into(),
                    now.into(),
                    registration_id.into(),
                ],
            )
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn touch_login(
        &self,
        registration_id: i64,
        context: &AccessContext,
        new_score: Option<i64>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        match new_score {
            Some(score) => {
                self.store
                    .run(
                        "UPDATE device_registrations
                         SET last_login_at = ?1, last_login_ip = ?2,
                             security_score = ?3, updated_at = ?4
                         WHERE id = ?5",
                        vec![
                            now.clone().into(),
                            context.ip_address.clone().into(),
                            score.into(),
                            now.into(),
                            registration_id.into(),
                        ],
                    )
                    .await?;
            }
            None => {
                self.store
                    .run(
                        "UPDATE device_registrations
                         SET last_login_at = ?1, last_login_ip = ?2, updated_at = ?3
                         WHERE id = ?4",
                        vec![
                            now.clone().into(),
                            context.ip_address.clone().into(),
                            now.into(),
                            registration_id.into(),
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn log_attempt(
        &self,
        employee_id: &str,
        presented_hash: &str,
        result: AccessResult,
        context: &AccessContext,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        self.audit
            .log_access(AccessLogEntry {
                employee_id: employee_id.to_string(),
                fingerprint_hash: Some(presented_hash.to_string()),
                access_result: result,
                ip_address: context.ip_address.clone(),
                user_agent: context.user_agent.clone(),
                security_notes: notes.map(str::to_string),
            })
            .await
    }
}

fn decayed(score: i64, decay: i64) -> i64 {
    (score - decay).max(0)
}

fn require(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

pub(crate) fn map_registration_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<DeviceRegistration> {
    let status: String = row.get(5)?;
    let registered_at: String = row.get(8)?;
    let last_login_at: Option<String> = row.get(9)?;
    let approved_at: Option<String> = row.get(13)?;
    Ok(DeviceRegistration {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        full_name: row.get(2)?,
        device_id: row.get(3)?,
        fingerprint_hash: row.get(4)?,
        status: DeviceStatus::from_str(&status).map_err(|e| conversion_failure(5, e))?,
        registration_ip: row.get(6)?,
        user_agent: row.get(7)?,
        registered_at: parse_rfc3339(&registered_at, 8)?,
        last_login_at: last_login_at
            .map(|raw| parse_rfc3339(&raw, 9))
            .transpose()?,
        last_login_ip: row.get(10)?,
        security_score: row.get(11)?,
        approved_by: row.get(12)?,
        approved_at: approved_at.map(|raw| parse_rfc3339(&raw, 13)).transpose()?,
        approval_reason: row.get(14)?,
    })
}

fn parse_rfc3339(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(column, e.to_string()))
}

fn conversion_failure(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicegateConfig;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        store: Arc<Store>,
        audit: AuditLog,
        engine: RegistrationEngine,
    }

    fn harness(auto_approve: bool) -> Harness {
        let tmp = TempDir::new().unwrap();
        let config = DevicegateConfig {
            db_path: tmp.path().join("gate.db"),
            ..Default::default()
        };
        let store = Arc::new(Store::connect(&config).unwrap());
        let audit = AuditLog::new(store.clone());
        let engine = RegistrationEngine::new(
            store.clone(),
            FingerprintHasher::new("test-pepper"),
            audit.clone(),
            auto_approve,
        );
        Harness {
            _tmp: tmp,
            store,
            audit,
            engine,
        }
    }

    fn request(employee_id: &str, device_id: &str, fingerprint: &str) -> RegistrationRequest {
        RegistrationRequest {
            employee_id: employee_id.to_string(),
            full_name: format!("Employee {employee_id}"),
            device_id: device_id.to_string(),
            fingerprint: fingerprint.to_string(),
            context: AccessContext {
                ip_address: Some("10.1.2.3".into()),
                user_agent: Some("Mozilla/5.0".into()),
            },
        }
    }

    /// Overwrite the stored hash with a copy whose first `changes` chars
    /// differ, giving a known similarity of (64 - changes) / 64.
    async fn skew_stored_hash(h: &Harness, employee_id: &str, changes: usize) {
        let stored: Option<String> = h
            .store
            .get(
                "SELECT fingerprint_hash FROM device_registrations WHERE employee_id = ?1",
                vec![employee_id.to_string().into()],
                |row| row.get(0),
            )
            .await
            .unwrap();
        let stored = stored.unwrap();
        let skewed: String = stored
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i < changes {
                    if c == 'f' {
                        '0'
                    } else {
                        'f'
                    }
                } else {
                    c
                }
            })
            .collect();
        h.store
            .run(
                "UPDATE device_registrations SET fingerprint_hash = ?1 WHERE employee_id = ?2",
                vec![skewed.into(), employee_id.to_string().into()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_defaults_to_pending_and_logs_event() {
        let h = harness(false);
        let outcome = h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        assert_eq!(outcome.status, DeviceStatus::Pending);
        assert!(outcome.registration_id > 0);

        let events = h.audit.events_for("E1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "DEVICE_REGISTERED");
        assert_eq!(events[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn register_auto_approve_policy() {
        let h = harness(true);
        let outcome = h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        assert_eq!(outcome.status, DeviceStatus::Approved);
    }

    #[tokio::test]
    async fn duplicate_employee_is_typed_error() {
        let h = harness(false);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        let err = h.engine.register(request("E1", "D2", "FPB")).await;
        assert!(matches!(err, Err(EngineError::DuplicateRegistration)));
    }

    #[tokio::test]
    async fn duplicate_device_is_typed_error() {
        let h = harness(false);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        let err = h.engine.register(request("E2", "D1", "FPB")).await;
        assert!(matches!(err, Err(EngineError::DuplicateRegistration)));
    }

    #[tokio::test]
    async fn empty_input_fails_validation_before_store() {
        let h = harness(false);
        let err = h.engine.register(request("", "D1", "FPA")).await;
        assert!(matches!(err, Err(EngineError::Validation(_))));

        let err = h
            .engine
            .validate_fingerprint("E1", "  ", &AccessContext::default())
            .await;
        assert!(matches!(err, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn exact_match_allows_and_logs_one_success_row() {
        let h = harness(true);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();

        let report = h
            .engine
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(report.valid);
        assert_eq!(report.reason, ValidationReason::FingerprintMatch);
        assert_eq!(report.reason.as_str(), "FINGERPRINT_MATCH");
        assert!(report.similarity.is_none());
        assert!(!report.requires_mfa);

        let history = h.audit.access_history("E1").await.unwrap();
        let successes: Vec<_> = history
            .iter()
            .filter(|r| r.access_result == AccessResult::Success)
            .collect();
        assert_eq!(successes.len(), 1);
    }

    #[tokio::test]
    async fn exact_match_updates_last_login() {
        let h = harness(true);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        let context = AccessContext {
            ip_address: Some("10.9.9.9".into()),
            user_agent: None,
        };
        h.engine
            .validate_fingerprint("E1", "FPA", &context)
            .await
            .unwrap();

        let registration = h
            .engine
            .check_registration("E1", "D1", &AccessContext::default())
            .await
            .unwrap()
            .unwrap();
        assert!(registration.last_login_at.is_some());
        assert_eq!(registration.last_login_ip.as_deref(), Some("10.9.9.9"));
        assert_eq!(registration.security_score, 100);
    }

    #[tokio::test]
    async fn minor_drift_allows_with_low_event() {
        let h = harness(true);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        // 8 of 64 chars differ: similarity 56/64 = 0.875 — minor band.
        skew_stored_hash(&h, "E1", 8).await;

        let report = h
            .engine
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(report.valid);
        assert_eq!(report.reason, ValidationReason::MinorDrift);
        assert!((report.similarity.unwrap() - 0.875).abs() < 1e-9);
        assert!(!report.requires_mfa);

        let events = h.audit.events_for("E1").await.unwrap();
        let drift: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "FINGERPRINT_DRIFT")
            .collect();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].severity, Severity::Low);

        // Score decayed, status still approved.
        let registration = h
            .engine
            .check_registration("E1", "D1", &AccessContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registration.security_score, 95);
        assert_eq!(registration.status, DeviceStatus::Approved);
    }

    #[tokio::test]
    async fn major_drift_requires_mfa_and_flips_status() {
        let h = harness(true);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        // 20 of 64 chars differ: similarity 44/64 = 0.6875 — major band.
        skew_stored_hash(&h, "E1", 20).await;

        let report = h
            .engine
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.reason, ValidationReason::MajorDrift);
        assert!(report.requires_mfa);
        assert!((report.similarity.unwrap() - 0.6875).abs() < 1e-9);

        let events = h.audit.events_for("E1").await.unwrap();
        let high: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "FINGERPRINT_DRIFT" && e.severity == Severity::High)
            .collect();
        assert_eq!(high.len(), 1);

        // approved -> drift is automatic; the device no longer checks out.
        assert!(h
            .engine
            .check_registration("E1", "D1", &AccessContext::default())
            .await
            .unwrap()
            .is_none());

        let history = h.audit.access_history("E1").await.unwrap();
        assert_eq!(history[0].access_result, AccessResult::DriftDetected);
    }

    #[tokio::test]
    async fn mismatch_blocks_with_critical_event() {
        let h = harness(true);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        // 30 of 64 chars differ: similarity 34/64 ≈ 0.531 — mismatch.
        skew_stored_hash(&h, "E1", 30).await;

        let report = h
            .engine
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.reason, ValidationReason::FingerprintMismatch);
        assert!(!report.requires_mfa);

        let events = h.audit.events_for("E1").await.unwrap();
        let critical: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "FINGERPRINT_MISMATCH")
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].severity, Severity::Critical);

        let history = h.audit.access_history("E1").await.unwrap();
        assert_eq!(history[0].access_result, AccessResult::Blocked);
    }

    #[tokio::test]
    async fn unregistered_employee_is_distinct_outcome() {
        let h = harness(false);
        let report = h
            .engine
            .validate_fingerprint("GHOST", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.reason, ValidationReason::DeviceNotRegistered);

        // The attempt is still auditable.
        let history = h.audit.access_history("GHOST").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].access_result, AccessResult::Pending);
    }

    #[tokio::test]
    async fn unapproved_device_reports_current_status() {
        let h = harness(false);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();

        let report = h
            .engine
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.reason, ValidationReason::DeviceNotApproved);
        assert_eq!(report.status, Some(DeviceStatus::Pending));
    }

    #[tokio::test]
    async fn check_registration_hit_appends_success_log() {
        let h = harness(true);
        h.engine.register(request("E1", "D1", "FPA")).await.unwrap();

        let registration = h
            .engine
            .check_registration("E1", "D1", &AccessContext::default())
            .await
            .unwrap();
        assert!(registration.is_some());

        let history = h.audit.access_history("E1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].access_result, AccessResult::Success);

        // Miss records nothing.
        assert!(h
            .engine
            .check_registration("E1", "OTHER", &AccessContext::default())
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.audit.access_history("E1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admin_state_machine_transitions() {
        let h = harness(false);
        let reg = h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        let id = reg.registration_id;

        // pending -> approved
        assert!(h.engine.approve_device(id, "admin1", "ok").await.unwrap());
        // approving again is a no-op (already processed)
        assert!(!h.engine.approve_device(id, "admin1", "ok").await.unwrap());
        // approved -> blocked
        assert!(h.engine.block_device(id, "admin1", "lost device").await.unwrap());
        // blocked is terminal
        assert!(!h.engine.approve_device(id, "admin1", "undo").await.unwrap());

        // A second registration walks pending -> blocked via reject.
        let reg2 = h.engine.register(request("E2", "D2", "FPB")).await.unwrap();
        assert!(h
            .engine
            .reject_device(reg2.registration_id, "admin1", "policy violation")
            .await
            .unwrap());
        assert!(!h
            .engine
            .reject_device(reg2.registration_id, "admin1", "twice")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn drift_reapproval_restores_access() {
        let h = harness(true);
        let reg = h.engine.register(request("E1", "D1", "FPA")).await.unwrap();
        skew_stored_hash(&h, "E1", 20).await;
        h.engine
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();

        // drift -> approved via admin re-approve.
        assert!(h
            .engine
            .approve_device(reg.registration_id, "admin1", "MFA passed")
            .await
            .unwrap());
        assert!(h
            .engine
            .check_registration("E1", "D1", &AccessContext::default())
            .await
            .unwrap()
            .is_some());
    }
}
