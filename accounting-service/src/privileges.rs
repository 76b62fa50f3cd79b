//! Privilege slugs granted by plan versions.

pub const DATA_CLEANUP: &str = "data_cleanup";
pub const OUTBOUND_SMS: &str = "outbound_sms";
pub const INBOUND_SMS: &str = "inbound_sms";
pub const ROLE_BASED_ACCESS: &str = "role_based_access";
pub const API_ACCESS: &str = "api_access";
pub const ADVANCED_DOMAIN_SECURITY: &str = "advanced_domain_security";
pub const PRACTICE_MOBILE_WORKERS: &str = "practice_mobile_workers";
pub const REPORT_BUILDER: &str = "report_builder";

/// Every privilege a plan can grant.
pub const MAX_PRIVILEGES: &[&str] = &[
    DATA_CLEANUP,
    OUTBOUND_SMS,
    INBOUND_SMS,
    ROLE_BASED_ACCESS,
    API_ACCESS,
    ADVANCED_DOMAIN_SECURITY,
    PRACTICE_MOBILE_WORKERS,
    REPORT_BUILDER,
];

pub fn is_known(privilege: &str) -> bool {
    MAX_PRIVILEGES.contains(&privilege)
}
