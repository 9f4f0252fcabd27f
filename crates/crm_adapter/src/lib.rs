#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crm_engines::permissions::{
    can_assign_leads, can_create_lead, can_delete_lead, can_drag_drop_in_pipeline,
    can_manage_pipeline_stages, can_perform_verification, can_see_assignment_section,
    has_permission, is_pipeline_read_only, leads_view_filter, role_permissions,
};
use crm_engines::verification::{SyncPhase, VerificationProgress};
use crm_kernel_contracts::access::{AccessLevel, LeadsViewFilter, Permission, Role, UserId};
use crm_kernel_contracts::lead::{CallCenterId, LeadId, LeadInput, LeadPatch, LeadRecord};
use crm_kernel_contracts::verification::{
    VerificationItemId, VerificationItemRecord, VerificationSessionId,
    VerificationSessionRecord, VerificationSessionStatus,
};
use crm_kernel_contracts::ContractViolation;
use crm_os::clock::SystemClock;
use crm_os::lead_access::{LeadAccessError, LeadAccessWiring, UserContext};
use crm_os::verification_sync::{SyncError, VerificationSync, VerificationSyncConfig};
use crm_storage::store::{InMemoryCrmStore, StorageError};
use tracing::{debug, info, warn};

pub const HEADER_USER_ID: &str = "x-crm-user-id";
pub const HEADER_ROLE: &str = "x-crm-role";
pub const HEADER_CALL_CENTER_ID: &str = "x-crm-call-center-id";

pub const ENV_SYNC_RETRY_DELAY_MS: &str = "CRM_SYNC_RETRY_DELAY_MS";

/// Slack on top of the configured retry delay while a request waits for the
/// single empty-session re-fetch.
const SYNC_RETRY_WAIT_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Denied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl AdapterError {
    pub fn outcome(&self) -> &'static str {
        match self {
            AdapterError::BadRequest(_) => "REJECTED",
            AdapterError::Denied(_) => "DENIED",
            AdapterError::NotFound(_) => "NOT_FOUND",
            AdapterError::Conflict(_) => "CONFLICT",
            AdapterError::Internal(_) => "FAILED",
        }
    }

    pub fn to_response(&self) -> AdapterErrorResponse {
        AdapterErrorResponse {
            status: "error".to_string(),
            outcome: self.outcome().to_string(),
            reason: Some(self.to_string()),
        }
    }
}

impl From<ContractViolation> for AdapterError {
    fn from(err: ContractViolation) -> Self {
        AdapterError::BadRequest(err.to_string())
    }
}

impl From<StorageError> for AdapterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => AdapterError::NotFound(err.to_string()),
            StorageError::DuplicateKey { .. } => AdapterError::Conflict(err.to_string()),
            StorageError::ContractViolation(_) | StorageError::ForeignKeyViolation { .. } => {
                AdapterError::BadRequest(err.to_string())
            }
            StorageError::LockPoisoned => AdapterError::Internal(err.to_string()),
        }
    }
}

impl From<LeadAccessError> for AdapterError {
    fn from(err: LeadAccessError) -> Self {
        match err {
            LeadAccessError::Denied { reason, .. } => AdapterError::Denied(reason.to_string()),
            LeadAccessError::Storage(err) => err.into(),
        }
    }
}

impl From<SyncError> for AdapterError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Storage(err) => err.into(),
            SyncError::UnknownItem(_) => AdapterError::NotFound(err.to_string()),
            SyncError::StatusTransition { .. } => AdapterError::Conflict(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub session_subscribers: usize,
    pub item_subscribers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CapabilityFlags {
    pub can_create_lead: bool,
    pub can_delete_lead: bool,
    pub can_assign_leads: bool,
    pub can_drag_drop_in_pipeline: bool,
    pub is_pipeline_read_only: bool,
    pub can_manage_pipeline_stages: bool,
    pub can_see_assignment_section: bool,
    pub can_perform_verification: bool,
}

impl CapabilityFlags {
    pub fn for_role(role: Option<Role>) -> Self {
        Self {
            can_create_lead: can_create_lead(role),
            can_delete_lead: can_delete_lead(role),
            can_assign_leads: can_assign_leads(role),
            can_drag_drop_in_pipeline: can_drag_drop_in_pipeline(role),
            is_pipeline_read_only: is_pipeline_read_only(role),
            can_manage_pipeline_stages: can_manage_pipeline_stages(role),
            can_see_assignment_section: can_see_assignment_section(role),
            can_perform_verification: can_perform_verification(role),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PermissionsResponse {
    pub status: String,
    pub role: Option<Role>,
    pub access_level: Option<AccessLevel>,
    pub permissions: Vec<Permission>,
    pub leads_view: LeadsViewFilter,
    pub capabilities: CapabilityFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LeadsResponse {
    pub status: String,
    pub leads: Vec<LeadRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LeadResponse {
    pub status: String,
    pub lead: LeadRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VerificationSnapshotResponse {
    pub status: String,
    pub phase: SyncPhase,
    pub session: Option<VerificationSessionRecord>,
    pub items: Vec<VerificationItemRecord>,
    pub progress: VerificationProgress,
    pub error: Option<String>,
}

/// Field edits applied to one item, in the order verified value, notes,
/// verification flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VerificationItemUpdateRequest {
    #[serde(default)]
    pub verified_value: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_verified: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VerificationStatusUpdateRequest {
    pub status: VerificationSessionStatus,
}

/// Builds the caller context from the identity headers. Blank headers are
/// treated as absent. An unrecognized role label yields no role, which every
/// permission check denies.
pub fn user_context_from_headers(
    user_id: Option<&str>,
    role: Option<&str>,
    call_center_id: Option<&str>,
) -> Result<UserContext, AdapterError> {
    let user_id = present(user_id).map(UserId::new).transpose()?;
    let role = present(role).and_then(|label| {
        let role = Role::parse(label);
        if role.is_none() {
            debug!(label, "unknown role label in role header");
        }
        role
    });
    let call_center_id = present(call_center_id)
        .map(CallCenterId::new)
        .transpose()?;
    Ok(UserContext::v1(user_id, role, call_center_id))
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_sync_retry_delay_ms(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (100..=60_000).contains(v))
        .unwrap_or(1_000)
}

pub struct AdapterRuntime {
    store: Arc<InMemoryCrmStore>,
    leads: LeadAccessWiring<InMemoryCrmStore>,
    sync_config: VerificationSyncConfig,
}

impl Default for AdapterRuntime {
    fn default() -> Self {
        Self::new(
            Arc::new(InMemoryCrmStore::new_in_memory()),
            VerificationSyncConfig::mvp_v1(),
        )
    }
}

impl AdapterRuntime {
    pub fn new(store: Arc<InMemoryCrmStore>, sync_config: VerificationSyncConfig) -> Self {
        Self {
            leads: LeadAccessWiring::new(store.clone(), SystemClock),
            store,
            sync_config,
        }
    }

    pub fn default_from_env() -> Result<Self, String> {
        let retry_delay_ms =
            parse_sync_retry_delay_ms(env::var(ENV_SYNC_RETRY_DELAY_MS).ok().as_deref());
        let sync_config = VerificationSyncConfig {
            retry_delay: Duration::from_millis(retry_delay_ms),
        };
        info!(retry_delay_ms, "adapter runtime configured");
        Ok(Self::new(
            Arc::new(InMemoryCrmStore::new_in_memory()),
            sync_config,
        ))
    }

    pub fn store(&self) -> &Arc<InMemoryCrmStore> {
        &self.store
    }

    pub fn sync_config(&self) -> VerificationSyncConfig {
        self.sync_config
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            session_subscribers: self.store.session_subscriber_count(),
            item_subscribers: self.store.item_subscriber_count(),
        }
    }

    pub fn permissions_report(&self, ctx: &UserContext) -> PermissionsResponse {
        let granted = ctx.role.map(role_permissions);
        PermissionsResponse {
            status: "ok".to_string(),
            role: ctx.role,
            access_level: granted.as_ref().map(|g| g.access_level),
            permissions: granted
                .map(|g| g.permissions.into_iter().collect())
                .unwrap_or_default(),
            leads_view: leads_view_filter(ctx.role, ctx.user_id.as_ref()),
            capabilities: CapabilityFlags::for_role(ctx.role),
        }
    }

    pub async fn list_leads(&self, ctx: &UserContext) -> Result<LeadsResponse, AdapterError> {
        let leads = self.leads.list_visible_leads(ctx).await?;
        Ok(LeadsResponse {
            status: "ok".to_string(),
            leads,
        })
    }

    pub async fn create_lead(
        &self,
        ctx: &UserContext,
        input: LeadInput,
    ) -> Result<LeadResponse, AdapterError> {
        let lead = self.leads.create_lead(ctx, input).await?;
        Ok(lead_response(lead))
    }

    /// Routes a patch that only moves the pipeline stage through the pipeline
    /// gate, and one that only reassigns through the assignment gate. Any other
    /// patch is a regular edit.
    pub async fn update_lead(
        &self,
        ctx: &UserContext,
        lead_id: &str,
        patch: LeadPatch,
    ) -> Result<LeadResponse, AdapterError> {
        let lead_id = LeadId::new(lead_id)?;
        let lead = match classify_patch(patch) {
            PatchRoute::Stage(stage) => {
                self.leads
                    .move_pipeline_stage(ctx, &lead_id, stage)
                    .await?
            }
            PatchRoute::Assign(agent_id) => self.leads.assign_lead(ctx, &lead_id, agent_id).await?,
            PatchRoute::Edit(patch) => self.leads.update_lead(ctx, &lead_id, patch).await?,
        };
        Ok(lead_response(lead))
    }

    pub async fn delete_lead(
        &self,
        ctx: &UserContext,
        lead_id: &str,
    ) -> Result<LeadResponse, AdapterError> {
        let lead_id = LeadId::new(lead_id)?;
        let lead = self.leads.delete_lead(ctx, &lead_id).await?;
        Ok(lead_response(lead))
    }

    pub async fn verification_snapshot(
        &self,
        ctx: &UserContext,
        session_id: &str,
    ) -> Result<VerificationSnapshotResponse, AdapterError> {
        require(ctx, Permission::ViewVerification)?;
        let sync = self.mount_loaded(session_id).await?;
        Ok(snapshot(&sync))
    }

    pub async fn update_verification_item(
        &self,
        ctx: &UserContext,
        session_id: &str,
        item_id: &str,
        request: VerificationItemUpdateRequest,
    ) -> Result<VerificationSnapshotResponse, AdapterError> {
        require(ctx, Permission::PerformVerification)?;
        let item_id = VerificationItemId::new(item_id)?;
        let mut sync = self.mount_loaded(session_id).await?;
        if sync.state().item(&item_id).is_none() {
            return Err(SyncError::UnknownItem(item_id).into());
        }
        if let Some(value) = request.verified_value {
            sync.update_verified_value(&item_id, value).await?;
        }
        if let Some(notes) = request.notes {
            sync.update_verification_notes(&item_id, notes).await?;
        }
        if let Some(is_verified) = request.is_verified {
            sync.toggle_verification(&item_id, is_verified).await?;
        }
        debug!(session_id, item_id = %item_id, "verification item updated");
        Ok(snapshot(&sync))
    }

    pub async fn update_verification_status(
        &self,
        ctx: &UserContext,
        session_id: &str,
        request: VerificationStatusUpdateRequest,
    ) -> Result<VerificationSnapshotResponse, AdapterError> {
        require(ctx, Permission::PerformVerification)?;
        let mut sync = self.mount_loaded(session_id).await?;
        sync.update_session_status(request.status).await?;
        Ok(snapshot(&sync))
    }

    /// Mounts the session for one request. A session that loaded with no
    /// items is held until its single re-fetch has run.
    async fn mount_loaded(
        &self,
        session_id: &str,
    ) -> Result<VerificationSync<InMemoryCrmStore>, AdapterError> {
        let session_id = VerificationSessionId::new(session_id)?;
        let mut sync = VerificationSync::mount(
            self.store.clone(),
            SystemClock,
            self.sync_config,
            session_id,
        )
        .await;
        if sync.retry_pending() {
            let wait = self.sync_config.retry_delay + SYNC_RETRY_WAIT_MARGIN;
            let settled = tokio::time::timeout(wait, async {
                while sync.retry_pending() {
                    if sync.next_event().await.is_none() {
                        break;
                    }
                }
            })
            .await;
            if settled.is_err() {
                warn!(session_id = %sync.session_id(), ?wait, "verification retry did not settle");
            }
        }
        if sync.phase() == SyncPhase::Error {
            let reason = sync.error().unwrap_or("verification session unavailable");
            return Err(AdapterError::NotFound(reason.to_string()));
        }
        Ok(sync)
    }
}

enum PatchRoute {
    Stage(String),
    Assign(Option<UserId>),
    Edit(LeadPatch),
}

fn classify_patch(patch: LeadPatch) -> PatchRoute {
    let rest = LeadPatch {
        pipeline_stage: None,
        assigned_agent_id: None,
        updated_at: None,
        ..patch.clone()
    };
    if rest != LeadPatch::default() {
        return PatchRoute::Edit(patch);
    }
    match (patch.pipeline_stage, patch.assigned_agent_id) {
        (Some(stage), None) => PatchRoute::Stage(stage),
        (None, Some(agent_id)) => PatchRoute::Assign(agent_id),
        (pipeline_stage, assigned_agent_id) => PatchRoute::Edit(LeadPatch {
            pipeline_stage,
            assigned_agent_id,
            ..patch
        }),
    }
}

fn require(ctx: &UserContext, permission: Permission) -> Result<(), AdapterError> {
    if has_permission(ctx.role, permission) {
        Ok(())
    } else {
        Err(AdapterError::Denied(format!(
            "role lacks permission {permission:?}"
        )))
    }
}

fn lead_response(lead: LeadRecord) -> LeadResponse {
    LeadResponse {
        status: "ok".to_string(),
        lead,
    }
}

fn snapshot(sync: &VerificationSync<InMemoryCrmStore>) -> VerificationSnapshotResponse {
    VerificationSnapshotResponse {
        status: "ok".to_string(),
        phase: sync.phase(),
        session: sync.session().cloned(),
        items: sync.items().to_vec(),
        progress: sync.progress(),
        error: sync.error().map(str::to_string),
    }
}
