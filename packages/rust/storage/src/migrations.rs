//! SQL migration definitions for the ContactForge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: jobs, contacts, email_candidates, audit_events",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Enrichment jobs
CREATE TABLE IF NOT EXISTS jobs (
    id                 TEXT PRIMARY KEY,
    org_name           TEXT NOT NULL,
    website            TEXT,
    social_profile_url TEXT,
    region_code        TEXT,
    organization_id    TEXT,
    requested_by       TEXT NOT NULL,
    status             TEXT NOT NULL,
    priority           INTEGER NOT NULL,
    attempt            INTEGER NOT NULL DEFAULT 0,
    max_attempts       INTEGER NOT NULL,
    last_stage         TEXT,
    cancel_requested   INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL,
    started_at         TEXT,
    completed_at       TEXT,
    last_error         TEXT,
    CHECK (attempt <= max_attempts)
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

-- Canonical contacts produced by deduplication
CREATE TABLE IF NOT EXISTS contacts (
    id                 TEXT PRIMARY KEY,
    job_id             TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    organization_id    TEXT,
    natural_key        TEXT NOT NULL,
    first_name         TEXT NOT NULL,
    last_name          TEXT NOT NULL,
    job_title          TEXT,
    organization       TEXT,
    profile_url        TEXT,
    confidence         INTEGER NOT NULL,
    sources_json       TEXT NOT NULL,
    lawful_basis       TEXT NOT NULL,
    compliance_checked INTEGER NOT NULL DEFAULT 0,
    notes              TEXT NOT NULL DEFAULT '',
    verified_at        TEXT,
    approved_at        TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    UNIQUE(job_id, natural_key)
);

CREATE INDEX IF NOT EXISTS idx_contacts_job_id ON contacts(job_id);

-- Email candidates per contact
CREATE TABLE IF NOT EXISTS email_candidates (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    email      TEXT NOT NULL,
    status     TEXT NOT NULL,
    score      REAL NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(contact_id, email)
);

CREATE INDEX IF NOT EXISTS idx_email_candidates_contact ON email_candidates(contact_id);

-- Append-only audit log
CREATE TABLE IF NOT EXISTS audit_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor_id   TEXT NOT NULL,
    timestamp  TEXT NOT NULL,
    metadata   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_events_job ON audit_events(job_id);

CREATE TRIGGER IF NOT EXISTS audit_events_no_update BEFORE UPDATE ON audit_events BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_no_delete BEFORE DELETE ON audit_events BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Worker lease on running jobs",
            sql: r#"
ALTER TABLE jobs ADD COLUMN lease_receipt TEXT;
ALTER TABLE jobs ADD COLUMN lease_expires_at INTEGER;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
