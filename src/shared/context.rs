//! Authenticated caller context and the tenant isolation guard.
//!
//! Every read filters by `CallerContext::organization_id` and every write
//! stamps it; client-supplied organization fields are only ever compared.

use serde::{Deserialize, Serialize};

use super::db::models::{OrganizationId, UserId};
use super::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Admin,
    User,
    Viewer,
    /// Edge device publishing through the broker.
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub role: Role,
}

impl CallerContext {
    pub fn new(user_id: impl Into<UserId>, organization_id: impl Into<OrganizationId>, role: Role) -> Self {
        CallerContext {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            role,
        }
    }

    /// Context for a device whose organization was established by the broker.
    pub fn device(organization_id: impl Into<OrganizationId>) -> Self {
        let organization_id = organization_id.into();
        CallerContext {
            user_id: format!("device:{}", organization_id),
            organization_id,
            role: Role::Device,
        }
    }

    /// Fails when a payload names an organization other than the caller's.
    pub fn check_payload(&self, payload_org: Option<&str>) -> AppResult<()> {
        match payload_org {
            Some(org) if org != self.organization_id => {
                log::warn!(
                    "tenant mismatch from user {} ({:?}): payload organization '{}' != '{}'",
                    self.user_id,
                    self.role,
                    org,
                    self.organization_id
                );
                Err(AppError::TenantMismatch {
                    caller: self.organization_id.clone(),
                    payload: org.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Same as `check_payload` for a required organization argument.
    pub fn check_organization(&self, organization_id: &str) -> AppResult<()> {
        self.check_payload(Some(organization_id))
    }

    /// True when the record belongs to the caller's tenant.
    pub fn owns(&self, organization_id: &str) -> bool {
        self.organization_id == organization_id
    }

    /// Hides records of other tenants behind `NotFound`.
    pub fn scope<T>(
        &self,
        record: Option<T>,
        org_of: impl Fn(&T) -> &str,
        entity: &'static str,
        key: impl ToString,
    ) -> AppResult<T> {
        match record {
            Some(r) if self.owns(org_of(&r)) => Ok(r),
            _ => Err(AppError::not_found(entity, key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::errors::ErrorType;

    #[test]
    fn payload_org_must_match_caller() {
        let ctx = CallerContext::new("u1", "org-a", Role::User);
        assert!(ctx.check_payload(None).is_ok());
        assert!(ctx.check_payload(Some("org-a")).is_ok());
        let err = ctx.check_payload(Some("org-b")).unwrap_err();
        assert_eq!(err.kind(), ErrorType::TenantMismatch);
    }

    #[test]
    fn foreign_records_look_absent() {
        let ctx = CallerContext::new("u1", "org-a", Role::User);
        let foreign = Some(("org-b".to_string(), 7));
        let err = ctx.scope(foreign, |r| r.0.as_str(), "sensor", 7).unwrap_err();
        assert_eq!(err.kind(), ErrorType::NotFound);

        let absent: Option<(String, i32)> = None;
        let err2 = ctx.scope(absent, |r| r.0.as_str(), "sensor", 7).unwrap_err();
        assert_eq!(err.to_string(), err2.to_string());
    }

    #[test]
    fn device_context_is_stamped_from_topic() {
        let ctx = CallerContext::device("org-a");
        assert_eq!(ctx.organization_id, "org-a");
        assert_eq!(ctx.role, Role::Device);
    }
}
