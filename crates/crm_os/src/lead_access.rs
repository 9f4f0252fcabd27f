#![forbid(unsafe_code)]

use std::sync::Arc;

use crm_engines::permissions::{
    can_assign_leads, can_create_lead, can_delete_lead, can_drag_drop_in_pipeline, can_edit_lead,
    has_any_permission, leads_view_filter,
};
use crm_kernel_contracts::access::{LeadsViewFilter, Permission, Role, UserId};
use crm_kernel_contracts::lead::{
    CallCenterId, LeadId, LeadInput, LeadPatch, LeadQuery, LeadRecord,
};
use crm_kernel_contracts::ReasonCodeId;
use crm_storage::repo::LeadStore;
use crm_storage::store::StorageError;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

pub mod reason_codes {
    use crm_kernel_contracts::ReasonCodeId;

    // Lead access wiring reason-code namespace.
    pub const LEAD_ACCESS_NO_VIEW_SCOPE: ReasonCodeId = ReasonCodeId(0x4C45_0101);
    pub const LEAD_ACCESS_NO_CALL_CENTER: ReasonCodeId = ReasonCodeId(0x4C45_0102);
    pub const LEAD_ACCESS_OUT_OF_SCOPE: ReasonCodeId = ReasonCodeId(0x4C45_0103);
    pub const LEAD_ACCESS_CREATE_DENIED: ReasonCodeId = ReasonCodeId(0x4C45_0201);
    pub const LEAD_ACCESS_EDIT_DENIED: ReasonCodeId = ReasonCodeId(0x4C45_0202);
    pub const LEAD_ACCESS_ASSIGN_DENIED: ReasonCodeId = ReasonCodeId(0x4C45_0203);
    pub const LEAD_ACCESS_MOVE_DENIED: ReasonCodeId = ReasonCodeId(0x4C45_0204);
    pub const LEAD_ACCESS_DELETE_DENIED: ReasonCodeId = ReasonCodeId(0x4C45_0205);
    pub const LEAD_ACCESS_CALL_CENTER_DENIED: ReasonCodeId = ReasonCodeId(0x4C45_0206);
}

/// Who is acting. Every field may be missing for an unauthenticated caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: Option<UserId>,
    pub role: Option<Role>,
    pub call_center_id: Option<CallCenterId>,
}

impl UserContext {
    pub fn v1(
        user_id: Option<UserId>,
        role: Option<Role>,
        call_center_id: Option<CallCenterId>,
    ) -> Self {
        Self {
            user_id,
            role,
            call_center_id,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether a lead may be placed in `call_center`. Roles without a global
    /// lead scope are pinned to their own center.
    fn may_place_in(&self, call_center: Option<&CallCenterId>) -> bool {
        has_any_permission(self.role, &[Permission::ViewAllLeads, Permission::EditAllLeads])
            || call_center == self.call_center_id.as_ref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeadAccessError {
    #[error("denied ({reason_code:?}): {reason}")]
    Denied {
        reason_code: ReasonCodeId,
        reason: &'static str,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LeadAccessError {
    fn denied(reason_code: ReasonCodeId, reason: &'static str) -> Self {
        LeadAccessError::Denied {
            reason_code,
            reason,
        }
    }
}

/// Resolves a view filter against the caller's context into a store query.
pub fn resolve_lead_query(ctx: &UserContext) -> Result<LeadQuery, LeadAccessError> {
    match leads_view_filter(ctx.role, ctx.user_id.as_ref()) {
        LeadsViewFilter::All => Ok(LeadQuery::All),
        LeadsViewFilter::AssignedAgent { user_id } => Ok(LeadQuery::AssignedAgent(user_id)),
        LeadsViewFilter::CallCenter { .. } => match &ctx.call_center_id {
            Some(center) => Ok(LeadQuery::CallCenter(center.clone())),
            None => Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_NO_CALL_CENTER,
                "caller has no call center",
            )),
        },
        LeadsViewFilter::NoAccess => Err(LeadAccessError::denied(
            reason_codes::LEAD_ACCESS_NO_VIEW_SCOPE,
            "role grants no lead view",
        )),
    }
}

/// Permission-gated lead operations over a [`LeadStore`].
pub struct LeadAccessWiring<S: LeadStore + ?Sized, C: Clock = SystemClock> {
    store: Arc<S>,
    clock: C,
}

impl<S: LeadStore + ?Sized, C: Clock> LeadAccessWiring<S, C> {
    pub fn new(store: Arc<S>, clock: C) -> Self {
        Self { store, clock }
    }

    pub async fn list_visible_leads(
        &self,
        ctx: &UserContext,
    ) -> Result<Vec<LeadRecord>, LeadAccessError> {
        let query = resolve_lead_query(ctx)?;
        let leads = self.store.list_leads(&query).await?;
        debug!(?query, count = leads.len(), "listed visible leads");
        Ok(leads)
    }

    /// Fetches a lead the caller can see. Leads outside the caller's scope are
    /// reported as denied, not as missing.
    pub async fn get_visible_lead(
        &self,
        ctx: &UserContext,
        lead_id: &LeadId,
    ) -> Result<LeadRecord, LeadAccessError> {
        let query = resolve_lead_query(ctx)?;
        let lead = self.store.get_lead(lead_id).await?;
        if !query.matches(&lead) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_OUT_OF_SCOPE,
                "lead is outside the caller's view",
            ));
        }
        Ok(lead)
    }

    /// Creates a lead. Missing ownership columns default to the caller's own
    /// user and call center; assigning to anyone else needs `assign_leads`,
    /// and a foreign call center needs a global lead scope.
    pub async fn create_lead(
        &self,
        ctx: &UserContext,
        mut input: LeadInput,
    ) -> Result<LeadRecord, LeadAccessError> {
        if !can_create_lead(ctx.role) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_CREATE_DENIED,
                "role cannot create leads",
            ));
        }
        if input.assigned_agent_id.is_none() && !can_assign_leads(ctx.role) {
            input.assigned_agent_id = ctx.user_id.clone();
        }
        if input.call_center_id.is_none() {
            input.call_center_id = ctx.call_center_id.clone();
        }
        if !ctx.may_place_in(input.call_center_id.as_ref()) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_CALL_CENTER_DENIED,
                "lead call center is outside the caller's scope",
            ));
        }
        let assigns_someone_else =
            input.assigned_agent_id.is_some() && input.assigned_agent_id != ctx.user_id;
        if assigns_someone_else && !can_assign_leads(ctx.role) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_ASSIGN_DENIED,
                "role cannot assign leads",
            ));
        }
        let lead = self.store.insert_lead(input, self.clock.now()).await?;
        info!(lead_id = %lead.id, role = ?ctx.role, "lead created");
        Ok(lead)
    }

    /// Applies a patch. Assignment columns additionally require
    /// `assign_leads`; moving the lead to another call center follows the
    /// same scope rule as `create_lead`.
    pub async fn update_lead(
        &self,
        ctx: &UserContext,
        lead_id: &LeadId,
        patch: LeadPatch,
    ) -> Result<LeadRecord, LeadAccessError> {
        let lead = self.store.get_lead(lead_id).await?;
        if !can_edit_lead(
            ctx.role,
            ctx.user_id.as_ref(),
            &lead,
            ctx.call_center_id.as_ref(),
        ) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_EDIT_DENIED,
                "role cannot edit this lead",
            ));
        }
        if let Some(call_center) = &patch.call_center_id {
            if !ctx.may_place_in(call_center.as_ref()) {
                return Err(LeadAccessError::denied(
                    reason_codes::LEAD_ACCESS_CALL_CENTER_DENIED,
                    "lead call center is outside the caller's scope",
                ));
            }
        }
        if patch.touches_assignment() && !can_assign_leads(ctx.role) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_ASSIGN_DENIED,
                "role cannot assign leads",
            ));
        }
        self.write_patch(lead_id, patch).await
    }

    /// Reassigns a visible lead to `agent_id`, or unassigns it with `None`.
    pub async fn assign_lead(
        &self,
        ctx: &UserContext,
        lead_id: &LeadId,
        agent_id: Option<UserId>,
    ) -> Result<LeadRecord, LeadAccessError> {
        if !can_assign_leads(ctx.role) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_ASSIGN_DENIED,
                "role cannot assign leads",
            ));
        }
        self.get_visible_lead(ctx, lead_id).await?;
        let patch = LeadPatch {
            assigned_agent_id: Some(agent_id),
            ..LeadPatch::default()
        };
        self.write_patch(lead_id, patch).await
    }

    /// Pipeline drag-and-drop.
    pub async fn move_pipeline_stage(
        &self,
        ctx: &UserContext,
        lead_id: &LeadId,
        stage: impl Into<String>,
    ) -> Result<LeadRecord, LeadAccessError> {
        if !can_drag_drop_in_pipeline(ctx.role) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_MOVE_DENIED,
                "pipeline is read-only for this role",
            ));
        }
        self.get_visible_lead(ctx, lead_id).await?;
        let patch = LeadPatch {
            pipeline_stage: Some(stage.into()),
            ..LeadPatch::default()
        };
        self.write_patch(lead_id, patch).await
    }

    pub async fn delete_lead(
        &self,
        ctx: &UserContext,
        lead_id: &LeadId,
    ) -> Result<LeadRecord, LeadAccessError> {
        if !can_delete_lead(ctx.role) {
            return Err(LeadAccessError::denied(
                reason_codes::LEAD_ACCESS_DELETE_DENIED,
                "role cannot delete leads",
            ));
        }
        let removed = self.store.delete_lead(lead_id).await?;
        info!(lead_id = %removed.id, "lead deleted");
        Ok(removed)
    }

    async fn write_patch(
        &self,
        lead_id: &LeadId,
        mut patch: LeadPatch,
    ) -> Result<LeadRecord, LeadAccessError> {
        patch.updated_at = Some(self.clock.now());
        let lead = self.store.update_lead(lead_id, &patch).await?;
        debug!(lead_id = %lead.id, stage = %lead.pipeline_stage, "lead updated");
        Ok(lead)
    }
}
