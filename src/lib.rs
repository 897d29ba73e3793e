//! devicegate — trusted-device access control engine.
//!
//! Employees register a device fingerprint tied to their identity; later
//! logins are validated against the stored hash with tolerance for
//! natural drift (browser/OS updates) while stolen-credential access is
//! blocked. The engine owns the decision logic only — HTTP routing,
//! admin UI and the browser-side fingerprint collector are external
//! callers of this crate.
//!
//! ## Components
//! - [`store::Store`] — SQLite persistence behind a bounded connection
//!   pool (WAL, busy_timeout; pool size caps in-flight statements)
//! - [`fingerprint::FingerprintHasher`] — peppered HMAC-SHA256 hashing
//!   plus positional drift similarity
//! - [`registration::RegistrationEngine`] — registration lifecycle,
//!   drift decision table, admin state machine
//! - [`audit::AuditLog`] — append-only access log and security events
//! - [`bulk::BulkDeviceManager`] — capped batch approve/reject and the
//!   pending-queue risk report

pub mod audit;
pub mod bulk;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod registration;
pub mod store;

pub use audit::{AccessResult, AuditLog, SecurityEventKind, Severity};
pub use bulk::{BulkCriteria, BulkDeviceManager, BulkResult, PendingReport, ReportFilters};
pub use config::DevicegateConfig;
pub use error::{EngineError, StoreError};
pub use fingerprint::FingerprintHasher;
pub use registration::{
    AccessContext, DeviceRegistration, DeviceStatus, RegistrationEngine, RegistrationRequest,
    ValidationReason, ValidationReport,
};
pub use store::Store;

use std::sync::Arc;

/// Fully wired engine: one store, shared audit trail, registration
/// engine and bulk manager built from a single config.
#[derive(Clone)]
pub struct Devicegate {
    pub store: Arc<Store>,
    pub audit: AuditLog,
    pub registration: RegistrationEngine,
    pub bulk: BulkDeviceManager,
}

impl Devicegate {
    /// Connect the store and construct every component with explicit
    /// dependency injection — no global state.
    pub fn open(config: &DevicegateConfig) -> Result<Self, StoreError> {
        let store = Arc::new(Store::connect(config)?);
        let audit = AuditLog::new(store.clone());
        let hasher = FingerprintHasher::new(config.resolve_pepper());
        let registration = RegistrationEngine::new(
            store.clone(),
            hasher,
            audit.clone(),
            config.auto_approve_registrations,
        );
        let bulk = BulkDeviceManager::new(store.clone(), audit.clone(), config.max_batch_size);
        Ok(Self {
            store,
            audit,
            registration,
            bulk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_wires_the_full_engine() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let tmp = TempDir::new().unwrap();
        let config = DevicegateConfig {
            db_path: tmp.path().join("gate.db"),
            auto_approve_registrations: true,
            ..Default::default()
        };
        let gate = Devicegate::open(&config).unwrap();

        gate.registration
            .register(RegistrationRequest {
                employee_id: "E1".into(),
                full_name: "Employee One".into(),
                device_id: "D1".into(),
                fingerprint: "FPA".into(),
                context: AccessContext::default(),
            })
            .await
            .unwrap();

        let report = gate
            .registration
            .validate_fingerprint("E1", "FPA", &AccessContext::default())
            .await
            .unwrap();
        assert!(report.valid);
        assert_eq!(report.reason, ValidationReason::FingerprintMatch);

        // Shared store: the bulk manager sees the same data.
        let pending = gate.bulk.pending_devices(10).await.unwrap();
        assert!(pending.is_empty());
    }
}
