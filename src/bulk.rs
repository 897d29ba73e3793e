//! Bulk admin operations over pending device registrations.
//!
//! Batch approve/reject with criteria filtering, a hard per-batch safety
//! cap, per-device failure isolation, and an advisory risk report for
//! the pending queue. Operates independently of the registration engine:
//! it depends only on the persistence adapter and the audit log.
//!
//! Every batch writes exactly one summarizing security event; individual
//! device failures (typically a concurrent admin processing the same row)
//! are accumulated in the result, never aborting the batch.

use crate::audit::{AuditLog, SecurityEvent, SecurityEventKind, Severity};
use crate::error::EngineError;
use crate::registration::{map_registration_row, DeviceRegistration, DeviceStatus};
use crate::store::{SqlParams, Store};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Days a registration may sit pending before it is flagged MEDIUM risk.
const LONG_PENDING_DAYS: i64 = 7;

/// Access attempts against a pending registration above which it is
/// flagged HIGH risk.
const SUSPICIOUS_ATTEMPTS: i64 = 5;

/// Admin-supplied filter criteria for a bulk batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkCriteria {
    /// Substring match on full name or employee id.
    pub department: Option<String>,
    /// Inclusive lower bound on registration creation time.
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on registration creation time.
    pub date_to: Option<DateTime<Utc>>,
    /// Prefix match on the registration IP.
    pub ip_range: Option<String>,
}

/// Filters for the pending-queue report.
#[derive(Debug, Clone, Default)]
pub struct ReportFilters {
    pub department: Option<String>,
    pub min_days_pending: Option<i64>,
}

/// One device successfully processed in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BulkDeviceOutcome {
    pub registration_id: i64,
    pub employee_id: String,
    pub status: DeviceStatus,
}

/// One device that failed mid-batch.
#[derive(Debug, Clone, Serialize)]
pub struct BulkItemError {
    pub registration_id: i64,
    pub employee_id: String,
    pub error: String,
}

/// Itemised outcome of one bulk invocation. Partial failure is always
/// explicit: `processed + failed == total`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResult {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<BulkItemError>,
    pub devices: Vec<BulkDeviceOutcome>,
}

/// Derived risk classification for a pending device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// Advisory action for a pending device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    SafeToApprove,
    ManualReview,
    RejectOrRequireMfa,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SafeToApprove => "SAFE_TO_APPROVE",
            Self::ManualReview => "MANUAL_REVIEW",
            Self::RejectOrRequireMfa => "REJECT_OR_REQUIRE_MFA",
        }
    }
}

/// One pending device with its risk analysis.
#[derive(Debug, Clone, Serialize)]
pub struct PendingDeviceRisk {
    pub registration_id: i64,
    pub employee_id: String,
    pub full_name: String,
    pub device_id: String,
    pub registration_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub days_pending: i64,
    pub access_attempts: i64,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub recommendation: Recommendation,
}

/// Risk distribution across the pending queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RiskSummary {
    pub low_risk: usize,
    pub medium_risk: usize,
    pub high_risk: usize,
}

/// The advisory pending-queue report. Never mutates state; always
/// freshly queried.
#[derive(Debug, Clone, Serialize)]
pub struct PendingReport {
    pub total: usize,
    pub devices: Vec<PendingDeviceRisk>,
    pub summary: RiskSummary,
}

/// One row of an admin's bulk-operation history.
#[derive(Debug, Clone, Serialize)]
pub struct BulkStatRow {
    pub action: String,
    pub count: i64,
    pub date: String,
}

/// Bulk-operation statistics over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct BulkStats {
    pub period_days: u32,
    pub operations: Vec<BulkStatRow>,
    pub total_operations: usize,
}

#[derive(Debug, Clone, Copy)]
enum BulkAction {
    Approve,
    Reject,
}

impl BulkAction {
    fn target(self) -> DeviceStatus {
        match self {
            // Rejection moves pending devices to the terminal blocked state.
            Self::Approve => DeviceStatus::Approved,
            Self::Reject => DeviceStatus::Blocked,
        }
    }

    fn event_kind(self) -> SecurityEventKind {
        match self {
            Self::Approve => SecurityEventKind::BulkDeviceApproval,
            Self::Reject => SecurityEventKind::BulkDeviceRejection,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingCandidate {
    id: i64,
    employee_id: String,
}

/// Batch approve/reject plus the pending risk report.
#[derive(Clone)]
pub struct BulkDeviceManager {
    store: Arc<Store>,
    audit: AuditLog,
    max_batch_size: u32,
}

impl BulkDeviceManager {
    pub fn new(store: Arc<Store>, audit: AuditLog, max_batch_size: u32) -> Self {
        Self {
            store,
            audit,
            max_batch_size,
        }
    }

    /// Approve every pending device matching `criteria`, oldest first,
    /// capped at the batch ceiling.
    pub async fn bulk_approve(
        &self,
        admin_id: &str,
        criteria: &BulkCriteria,
    ) -> Result<BulkResult, EngineError> {
        self.run_batch(admin_id, criteria, BulkAction::Approve, "Bulk approval")
            .await
    }

    /// Reject (block) every pending device matching `criteria`, oldest
    /// first, capped at the batch ceiling.
    pub async fn bulk_reject(
        &self,
        admin_id: &str,
        criteria: &BulkCriteria,
        reason: &str,
    ) -> Result<BulkResult, EngineError> {
        self.run_batch(admin_id, criteria, BulkAction::Reject, reason)
            .await
    }

    async fn run_batch(
        &self,
        admin_id: &str,
        criteria: &BulkCriteria,
        action: BulkAction,
        reason: &str,
    ) -> Result<BulkResult, EngineError> {
        if admin_id.trim().is_empty() {
            return Err(EngineError::Validation("admin_id must not be empty".into()));
        }

        let candidates = self.select_pending(criteria).await?;
        let result = self.process_batch(admin_id, &candidates, action, reason).await;

        self.audit
            .log_security_event(SecurityEvent {
                kind: action.event_kind(),
                severity: Severity::Medium,
                employee_id: Some(admin_id.to_string()),
                description: format!(
                    "Bulk {} {} of {} devices",
                    match action {
                        BulkAction::Approve => "approved",
                        BulkAction::Reject => "rejected",
                    },
                    result.processed,
                    result.total
                ),
                details: Some(serde_json::json!({
                    "criteria": criteria,
                    "total": result.total,
                    "processed": result.processed,
                    "failed": result.failed,
                })),
                ip_address: None,
            })
            .await?;

        tracing::info!(
            admin_id,
            total = result.total,
            processed = result.processed,
            failed = result.failed,
            "bulk device batch completed"
        );
        Ok(result)
    }

    /// Apply `action` to each candidate independently. A device that was
    /// concurrently processed (guarded UPDATE touches zero rows) or hits
    /// a driver error lands in `errors`; the batch always runs to the
    /// end.
    async fn process_batch(
        &self,
        admin_id: &str,
        candidates: &[PendingCandidate],
        action: BulkAction,
        reason: &str,
    ) -> BulkResult {
        let mut result = BulkResult {
            total: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let now = Utc::now().to_rfc3339();
            let params: SqlParams = vec![
                action.target().as_str().to_string().into(),
                admin_id.to_string().into(),
                now.clone().into(),
                reason.to_string().into(),
                now.into(),
                candidate.id.into(),
            ];
            let updated = self
                .store
                .run(
                    "UPDATE device_registrations
                     SET status = ?1, approved_by = ?2, approved_at = ?3,
                         approval_reason = ?4, updated_at = ?5
                     WHERE id = ?6 AND status = 'pending'",
                    params,
                )
                .await;

            match updated {
                Ok(run) if run.rows_affected > 0 => {
                    result.processed += 1;
                    result.devices.push(BulkDeviceOutcome {
                        registration_id: candidate.id,
                        employee_id: candidate.employee_id.clone(),
                        status: action.target(),
                    });
                }
                Ok(_) => {
                    result.failed += 1;
                    result.errors.push(BulkItemError {
                        registration_id: candidate.id,
                        employee_id: candidate.employee_id.clone(),
                        error: "device not found or already processed".into(),
                    });
                }
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(BulkItemError {
                        registration_id: candidate.id,
                        employee_id: candidate.employee_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    async fn select_pending(
        &self,
        criteria: &BulkCriteria,
    ) -> Result<Vec<PendingCandidate>, EngineError> {
        let mut sql = String::from(
            "SELECT id, employee_id FROM device_registrations WHERE status = 'pending'",
        );
        let mut params: SqlParams = Vec::new();
        let mut idx = 1;

        if let Some(ref department) = criteria.department {
            sql.push_str(&format!(
                " AND (full_name LIKE ?{idx} OR employee_id LIKE ?{})",
                idx + 1
            ));
            let pattern = format!("%{department}%");
            params.push(pattern.clone().into());
            params.push(pattern.into());
            idx += 2;
        }
        if let Some(date_from) = criteria.date_from {
            sql.push_str(&format!(" AND created_at >= ?{idx}"));
            params.push(date_from.to_rfc3339().into());
            idx += 1;
        }
        if let Some(date_to) = criteria.date_to {
            sql.push_str(&format!(" AND created_at <= ?{idx}"));
            params.push(date_to.to_rfc3339().into());
            idx += 1;
        }
        if let Some(ref ip_range) = criteria.ip_range {
            sql.push_str(&format!(" AND registration_ip LIKE ?{idx}"));
            params.push(format!("{ip_range}%").into());
            idx += 1;
        }

        sql.push_str(&format!(" ORDER BY created_at ASC LIMIT ?{idx}"));
        params.push(i64::from(self.max_batch_size).into());

        let candidates = self
            .store
            .all(&sql, params, |row| {
                Ok(PendingCandidate {
                    id: row.get(0)?,
                    employee_id: row.get(1)?,
                })
            })
            .await?;
        Ok(candidates)
    }

    /// Oldest-first listing of pending registrations.
    pub async fn pending_devices(
        &self,
        limit: u32,
    ) -> Result<Vec<DeviceRegistration>, EngineError> {
        let rows = self
            .store
            .all(
                "SELECT id, employee_id, full_name, device_id, fingerprint_hash, status,
                        registration_ip, user_agent, registered_at, last_login_at,
                        last_login_ip, security_score, approved_by, approved_at,
                        approval_reason
                 FROM device_registrations
                 WHERE status = 'pending'
                 ORDER BY created_at ASC
                 LIMIT ?1",
                vec![i64::from(limit).into()],
                map_registration_row,
            )
            .await?;
        Ok(rows)
    }

    /// Advisory risk report over the pending queue. Joins each pending
    /// registration with its access-log history; mutates nothing.
    pub async fn pending_report(
        &self,
        filters: &ReportFilters,
    ) -> Result<PendingReport, EngineError> {
        let mut sql = String::from(
            "SELECT dr.id, dr.employee_id, dr.full_name, dr.device_id,
                    dr.registration_ip, dr.user_agent, dr.created_at,
                    COUNT(dal.id) AS access_attempts,
                    COALESCE(SUM(CASE WHEN dal.access_result = 'blocked'
                                      THEN 1 ELSE 0 END), 0) AS blocked_attempts
             FROM device_registrations dr
             LEFT JOIN device_access_logs dal ON dal.employee_id = dr.employee_id
             WHERE dr.status = 'pending'",
        );
        let mut params: SqlParams = Vec::new();
        if let Some(ref department) = filters.department {
            sql.push_str(" AND (dr.full_name LIKE ?1 OR dr.employee_id LIKE ?2)");
            let pattern = format!("%{department}%");
            params.push(pattern.clone().into());
            params.push(pattern.into());
        }
        sql.push_str(" GROUP BY dr.id ORDER BY dr.created_at ASC");

        let rows = self
            .store
            .all(&sql, params, |row| {
                let created_at: String = row.get(6)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    created_at,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .await?;

        let now = Utc::now();
        let mut devices = Vec::new();
        let mut summary = RiskSummary::default();

        for (
            registration_id,
            employee_id,
            full_name,
            device_id,
            registration_ip,
            user_agent,
            created_raw,
            access_attempts,
            blocked_attempts,
        ) in rows
        {
            let created_at = DateTime::parse_from_rfc3339(&created_raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| EngineError::Validation(format!("corrupt created_at: {e}")))?;
            let days_pending = (now - created_at).num_days();
            if let Some(min_days) = filters.min_days_pending {
                if days_pending < min_days {
                    continue;
                }
            }

            let mut risk_level = RiskLevel::Low;
            let mut risk_factors = Vec::new();
            if days_pending > LONG_PENDING_DAYS {
                risk_level = RiskLevel::Medium;
                risk_factors.push("Long pending".to_string());
            }
            if access_attempts > SUSPICIOUS_ATTEMPTS {
                risk_level = RiskLevel::High;
                risk_factors.push("Multiple access attempts".to_string());
            }
            if blocked_attempts > 0 {
                risk_level = RiskLevel::High;
                risk_factors.push("Previous blocks".to_string());
            }
            let recommendation = match risk_level {
                RiskLevel::High => Recommendation::RejectOrRequireMfa,
                RiskLevel::Medium => Recommendation::ManualReview,
                RiskLevel::Low => Recommendation::SafeToApprove,
            };
            match risk_level {
                RiskLevel::Low => summary.low_risk += 1,
                RiskLevel::Medium => summary.medium_risk += 1,
                RiskLevel::High => summary.high_risk += 1,
            }

            devices.push(PendingDeviceRisk {
                registration_id,
                employee_id,
                full_name,
                device_id,
                registration_ip,
                user_agent,
                created_at,
                days_pending,
                access_attempts,
                risk_level,
                risk_factors,
                recommendation,
            });
        }

        Ok(PendingReport {
            total: devices.len(),
            devices,
            summary,
        })
    }

    /// Counts of this admin's bulk batches over a trailing window.
    pub async fn bulk_stats(&self, admin_id: &str, days: u32) -> Result<BulkStats, EngineError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let operations = self
            .store
            .all(
                "SELECT event_type, COUNT(*) AS count, DATE(created_at) AS date
                 FROM security_events
                 WHERE employee_id = ?1
                   AND event_type LIKE 'BULK_%'
                   AND created_at >= ?2
                 GROUP BY event_type, DATE(created_at)
                 ORDER BY date DESC",
                vec![admin_id.to_string().into(), cutoff.to_rfc3339().into()],
                |row| {
                    Ok(BulkStatRow {
                        action: row.get(0)?,
                        count: row.get(1)?,
                        date: row.get(2)?,
                    })
                },
            )
            .await?;
        Ok(BulkStats {
            period_days: days,
            total_operations: operations.len(),
            operations,
        })
    }
}
