//! Access and security event audit trail.
//!
//! Both writers are pure appends: they read no prior state and never
//! touch `device_registrations`. Rows are immutable in normal operation;
//! the only sanctioned deletion path is [`AuditLog::purge_expired`],
//! which enforces the retention horizon.
//!
//! Result and severity vocabularies are closed enums, so an out-of-enum
//! value cannot reach the store from this process. Strings read back from
//! the store parse strictly — an unknown value is a corruption signal and
//! fails fast instead of being coerced.

use crate::error::StoreError;
use crate::store::{SqlParams, Store};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Outcome category of a single access attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessResult {
    /// Fingerprint accepted, access granted.
    Success,
    /// Access denied outright.
    Blocked,
    /// Attempt against a not-yet-approved (or unknown) registration.
    Pending,
    /// Major drift detected; access held for MFA.
    DriftDetected,
}

impl AccessResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Blocked => "blocked",
            Self::Pending => "pending",
            Self::DriftDetected => "drift_detected",
        }
    }
}

impl FromStr for AccessResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "blocked" => Ok(Self::Blocked),
            "pending" => Ok(Self::Pending),
            "drift_detected" => Ok(Self::DriftDetected),
            other => Err(format!("unknown access result: {other}")),
        }
    }
}

/// Severity of a security event. Derived from the triggering condition
/// at the emitting site, never freely chosen by external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Kinds of security-relevant decisions the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventKind {
    DeviceRegistered,
    FingerprintDrift,
    FingerprintMismatch,
    BulkDeviceApproval,
    BulkDeviceRejection,
}

impl SecurityEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceRegistered => "DEVICE_REGISTERED",
            Self::FingerprintDrift => "FINGERPRINT_DRIFT",
            Self::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            Self::BulkDeviceApproval => "BULK_DEVICE_APPROVAL",
            Self::BulkDeviceRejection => "BULK_DEVICE_REJECTION",
        }
    }
}

/// One access attempt, about to be appended to the log.
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub employee_id: String,
    /// Hash presented at attempt time (None when the attempt never
    /// produced one, e.g. malformed input rejected upstream).
    pub fingerprint_hash: Option<String>,
    pub access_result: AccessResult,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub security_notes: Option<String>,
}

/// One security-relevant decision, about to be appended.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub severity: Severity,
    /// None for system-wide events.
    pub employee_id: Option<String>,
    pub description: String,
    /// Structured context, serialized to JSON at rest.
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
}

/// An access log row read back from the store.
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    pub id: i64,
    pub employee_id: String,
    pub fingerprint_hash: Option<String>,
    pub access_result: AccessResult,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub security_notes: Option<String>,
    pub access_time: DateTime<Utc>,
}

/// A security event row read back from the store.
#[derive(Debug, Clone)]
pub struct SecurityEventRecord {
    pub id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub employee_id: Option<String>,
    pub description: String,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the aggregated security report.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityReportRow {
    pub event_type: String,
    pub severity: Severity,
    pub count: i64,
    pub date: String,
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy)]
pub struct PurgeOutcome {
    pub access_logs_deleted: usize,
    pub security_events_deleted: usize,
}

/// Append-only audit writer over the shared store.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append one access attempt row. Insert only.
    pub async fn log_access(&self, entry: AccessLogEntry) -> Result<(), StoreError> {
        let params: SqlParams = vec![
            entry.employee_id.into(),
            entry.fingerprint_hash.into(),
            entry.access_result.as_str().to_string().into(),
            entry.ip_address.into(),
            entry.user_agent.into(),
            entry.security_notes.into(),
            Utc::now().to_rfc3339().into(),
        ];
        self.store
            .run(
                "INSERT INTO device_access_logs
                    (employee_id, fingerprint_hash, access_result,
                     ip_address, user_agent, security_notes, access_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params,
            )
            .await?;
        Ok(())
    }

    /// Append one security event row. Insert only.
    pub async fn log_security_event(&self, event: SecurityEvent) -> Result<(), StoreError> {
        let details = event
            .details
            .as_ref()
            .map(|d| d.to_string());
        tracing::info!(
            event_type = event.kind.as_str(),
            severity = event.severity.as_str(),
            employee_id = event.employee_id.as_deref().unwrap_or("-"),
            "security event"
        );
        let params: SqlParams = vec![
            event.kind.as_str().to_string().into(),
            event.severity.as_str().to_string().into(),
            event.employee_id.into(),
            event.description.into(),
            details.into(),
            event.ip_address.into(),
            Utc::now().to_rfc3339().into(),
        ];
        self.store
            .run(
                "INSERT INTO security_events
                    (event_type, severity, employee_id, description,
                     details, ip_address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params,
            )
            .await?;
        Ok(())
    }

    /// Full access history for one employee, newest first.
    pub async fn access_history(
        &self,
        employee_id: &str,
    ) -> Result<Vec<AccessLogRecord>, StoreError> {
        self.store
            .all(
                "SELECT id, employee_id, fingerprint_hash, access_result,
                        ip_address, user_agent, security_notes, access_time
                 FROM device_access_logs
                 WHERE employee_id = ?1
                 ORDER BY access_time DESC, id DESC",
                vec![employee_id.to_string().into()],
                map_access_row,
            )
            .await
    }

    /// Security events recorded for one employee, newest first.
    pub async fn events_for(
        &self,
        employee_id: &str,
    ) -> Result<Vec<SecurityEventRecord>, StoreError> {
        self.store
            .all(
                "SELECT id, event_type, severity, employee_id, description,
                        details, ip_address, created_at
                 FROM security_events
                 WHERE employee_id = ?1
                 ORDER BY created_at DESC, id DESC",
                vec![employee_id.to_string().into()],
                map_event_row,
            )
            .await
    }

    /// Event counts grouped by type, severity and day over the trailing
    /// window. Advisory, read-only.
    pub async fn security_report(&self, days: u32) -> Result<Vec<SecurityReportRow>, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.store
            .all(
                "SELECT event_type, severity, COUNT(*) AS count,
                        DATE(created_at) AS date
                 FROM security_events
                 WHERE created_at >= ?1
                 GROUP BY event_type, severity, DATE(created_at)
                 ORDER BY date DESC",
                vec![cutoff.to_rfc3339().into()],
                |row| {
                    let severity: String = row.get(1)?;
                    Ok(SecurityReportRow {
                        event_type: row.get(0)?,
                        severity: Severity::from_str(&severity).map_err(invalid_text(1))?,
                        count: row.get(2)?,
                        date: row.get(3)?,
                    })
                },
            )
            .await
    }

    /// Retention sweep: drop access logs older than the horizon, and
    /// LOW/MEDIUM security events older than the horizon. HIGH and
    /// CRITICAL events are kept indefinitely.
    pub async fn purge_expired(&self, retention_days: u32) -> Result<PurgeOutcome, StoreError> {
        let cutoff = (Utc::now() - Duration::days(i64::from(retention_days))).to_rfc3339();

        let access = self
            .store
            .run(
                "DELETE FROM device_access_logs WHERE access_time < ?1",
                vec![cutoff.clone().into()],
            )
            .await?;
        let events = self
            .store
            .run(
                "DELETE FROM security_events
                 WHERE created_at < ?1 AND severity IN ('LOW', 'MEDIUM')",
                vec![cutoff.into()],
            )
            .await?;

        tracing::info!(
            access_logs = access.rows_affected,
            security_events = events.rows_affected,
            retention_days,
            "audit retention sweep"
        );
        Ok(PurgeOutcome {
            access_logs_deleted: access.rows_affected,
            security_events_deleted: events.rows_affected,
        })
    }
}

fn map_access_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessLogRecord> {
    let result: String = row.get(3)?;
    let access_time: String = row.get(7)?;
    Ok(AccessLogRecord {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        fingerprint_hash: row.get(2)?,
        access_result: AccessResult::from_str(&result).map_err(invalid_text(3))?,
        ip_address: row.get(4)?,
        user_agent: row.get(5)?,
        security_notes: row.get(6)?,
        access_time: parse_timestamp(&access_time, 7)?,
    })
}

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecurityEventRecord> {
    let severity: String = row.get(2)?;
    let details: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(SecurityEventRecord {
        id: row.get(0)?,
        event_type: row.get(1)?,
        severity: Severity::from_str(&severity).map_err(invalid_text(2))?,
        employee_id: row.get(3)?,
        description: row.get(4)?,
        details: details
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| invalid_text(5)(e.to_string()))?,
        ip_address: row.get(6)?,
        created_at: parse_timestamp(&created_at, 7)?,
    })
}

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid_text(column)(e.to_string()))
}

/// Strict-parse failure for a TEXT column: corrupt data fails fast
/// instead of being coerced to a default.
fn invalid_text(column: usize) -> impl Fn(String) -> rusqlite::Error {
    move |message| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            message.into(),
        )
    }
}
