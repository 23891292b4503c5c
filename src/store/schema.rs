//! Database schema constants.
//!
//! All SQL schema definitions for the PostgreSQL store. The partial unique
//! index on deployments enforces the at-most-one-live-row-per-(name, namespace)
//! invariant; the unique constraint on request_id is the insert-time
//! idempotency guard.

/// SQL schema for creating the users table.
pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    external_id VARCHAR(255) NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the deployment_requests table.
pub const CREATE_DEPLOYMENT_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deployment_requests (
    id UUID PRIMARY KEY,
    request_id VARCHAR(255) NOT NULL UNIQUE,
    identifier VARCHAR(63) NOT NULL,
    name VARCHAR(255) NOT NULL,
    namespace VARCHAR(255) NOT NULL,
    request_type VARCHAR(16) NOT NULL,
    status VARCHAR(16) NOT NULL,
    image VARCHAR(255) NOT NULL,
    user_id UUID NOT NULL REFERENCES users(id),
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    failure_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the deployments table.
pub const CREATE_DEPLOYMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id UUID PRIMARY KEY,
    identifier VARCHAR(63) NOT NULL UNIQUE,
    name VARCHAR(255) NOT NULL,
    namespace VARCHAR(255) NOT NULL,
    image VARCHAR(255) NOT NULL,
    status VARCHAR(16) NOT NULL,
    user_id UUID NOT NULL REFERENCES users(id),
    resource_version VARCHAR(255) NOT NULL DEFAULT '',
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Partial unique index: at most one non-DELETED deployment per (name, namespace).
pub const CREATE_LIVE_DEPLOYMENT_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_live_name_namespace
ON deployments (name, namespace)
WHERE status <> 'DELETED'
"#;

/// Index supporting per-user listings of requests.
pub const CREATE_REQUEST_USER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deployment_requests_user_id
ON deployment_requests (user_id)
"#;

/// Index supporting per-user listings of deployments.
pub const CREATE_DEPLOYMENT_USER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deployments_user_id
ON deployments (user_id)
"#;

/// Returns all schema statements in creation order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_USERS_TABLE,
        CREATE_DEPLOYMENT_REQUESTS_TABLE,
        CREATE_DEPLOYMENTS_TABLE,
        CREATE_LIVE_DEPLOYMENT_INDEX,
        CREATE_REQUEST_USER_INDEX,
        CREATE_DEPLOYMENT_USER_INDEX,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_present() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 6);
        assert!(statements[0].contains("users"));
        assert!(statements[1].contains("deployment_requests"));
        assert!(statements[2].contains("deployments"));
    }

    #[test]
    fn test_live_index_excludes_deleted() {
        assert!(CREATE_LIVE_DEPLOYMENT_INDEX.contains("WHERE status <> 'DELETED'"));
        assert!(CREATE_LIVE_DEPLOYMENT_INDEX.contains("UNIQUE"));
    }
}
