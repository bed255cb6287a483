//! Database schema constants.
//!
//! All SQL schema definitions for the PostgreSQL storage backend: the queue,
//! agent usage and runtime state, the pipeline end products and the
//! single-row engine state used for the queue halt flag.

/// SQL schema for creating the queue_items table.
pub const CREATE_QUEUE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_items (
    id UUID PRIMARY KEY,
    item_type VARCHAR(50) NOT NULL,
    status VARCHAR(20) NOT NULL,
    sub_task JSONB,
    pipeline_state JSONB NOT NULL DEFAULT '{}',
    parent_item_id UUID,
    tracking_id UUID NOT NULL,
    lineage_depth INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    result_message TEXT,
    error_details TEXT
)
"#;

/// SQL schema for creating the agent_usage table. One row per agent; the
/// usage pool is shared by every scope.
pub const CREATE_AGENT_USAGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS agent_usage (
    agent_id VARCHAR(255) PRIMARY KEY,
    daily_usage DOUBLE PRECISION NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the agent_runtime table. One row per
/// (agent, scope) pair; `disable_reason` carries the prefixed wire string.
pub const CREATE_AGENT_RUNTIME_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS agent_runtime (
    agent_id VARCHAR(255) NOT NULL,
    scope VARCHAR(255) NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    disable_reason TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (agent_id, scope)
)
"#;

/// SQL schema for creating the job_matches table.
pub const CREATE_JOB_MATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_matches (
    id UUID PRIMARY KEY,
    tracking_id UUID NOT NULL,
    title VARCHAR(512) NOT NULL,
    company VARCHAR(255),
    url TEXT,
    score DOUBLE PRECISION NOT NULL,
    breakdown JSONB NOT NULL,
    facts JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the company_profiles table.
pub const CREATE_COMPANY_PROFILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS company_profiles (
    id UUID PRIMARY KEY,
    tracking_id UUID NOT NULL,
    name VARCHAR(255) NOT NULL,
    website TEXT,
    facts JSONB NOT NULL,
    analysis JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the job_sources table.
pub const CREATE_JOB_SOURCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_sources (
    id UUID PRIMARY KEY,
    tracking_id UUID NOT NULL,
    url TEXT NOT NULL,
    structure JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the engine_state table. A key/value row set;
/// currently the only key in use is the queue stop reason.
pub const CREATE_ENGINE_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS engine_state (
    key VARCHAR(64) PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_items_status_created ON queue_items(status, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_items_tracking_id ON queue_items(tracking_id);
CREATE INDEX IF NOT EXISTS idx_queue_items_parent ON queue_items(parent_item_id);
CREATE INDEX IF NOT EXISTS idx_job_matches_tracking_id ON job_matches(tracking_id);
CREATE INDEX IF NOT EXISTS idx_job_matches_score ON job_matches(score);
CREATE INDEX IF NOT EXISTS idx_company_profiles_tracking_id ON company_profiles(tracking_id);
CREATE INDEX IF NOT EXISTS idx_job_sources_url ON job_sources(url)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_QUEUE_ITEMS_TABLE,
        CREATE_AGENT_USAGE_TABLE,
        CREATE_AGENT_RUNTIME_TABLE,
        CREATE_JOB_MATCHES_TABLE,
        CREATE_COMPANY_PROFILES_TABLE,
        CREATE_JOB_SOURCES_TABLE,
        CREATE_ENGINE_STATE_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Queue items table name.
    pub const QUEUE_ITEMS: &str = "queue_items";
    /// Agent usage table name.
    pub const AGENT_USAGE: &str = "agent_usage";
    /// Agent runtime state table name.
    pub const AGENT_RUNTIME: &str = "agent_runtime";
    /// Job matches table name.
    pub const JOB_MATCHES: &str = "job_matches";
    /// Company profiles table name.
    pub const COMPANY_PROFILES: &str = "company_profiles";
    /// Job sources table name.
    pub const JOB_SOURCES: &str = "job_sources";
    /// Engine state table name.
    pub const ENGINE_STATE: &str = "engine_state";
}

/// Engine-state key for the queue halt reason.
pub const STOP_REASON_KEY: &str = "stop_reason";
