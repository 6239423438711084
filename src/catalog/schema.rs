/// Bookkeeping table for applied migrations. Created before anything else.
pub const MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Append-only: never edit or reorder an entry, only add new versions.
/// Downstream training and labeling tools read these tables directly.
pub const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "create_images",
        r#"
        CREATE TABLE images (
            record_id TEXT PRIMARY KEY,           -- UUID v7, time-ordered
            provider TEXT NOT NULL,
            provider_native_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,           -- SHA-256 hex of the stored bytes
            perceptual_hash TEXT NOT NULL,        -- base64 gradient hash
            storage_path TEXT NOT NULL,           -- relative to the data directory
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            label TEXT NOT NULL DEFAULT 'unknown' CHECK (label IN ('electric', 'acoustic', 'unknown')),
            quality_flags TEXT NOT NULL DEFAULT '[]',  -- JSON array
            ingested_at TEXT NOT NULL,            -- RFC 3339, UTC
            UNIQUE (provider, provider_native_id),
            UNIQUE (content_hash)
        );

        CREATE INDEX idx_images_label ON images(label);
        CREATE INDEX idx_images_provider ON images(provider);
        CREATE INDEX idx_images_ingested_at ON images(ingested_at);
        "#,
    ),
    (
        2,
        "create_runs",
        r#"
        CREATE TABLE runs (
            run_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            state TEXT NOT NULL,                  -- 'completed' or 'failed'
            cancelled INTEGER NOT NULL DEFAULT 0,
            fetched INTEGER NOT NULL DEFAULT 0,
            rejected_duplicate INTEGER NOT NULL DEFAULT 0,
            rejected_quality INTEGER NOT NULL DEFAULT 0,
            rejected_error INTEGER NOT NULL DEFAULT 0,
            accepted INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        );

        CREATE INDEX idx_runs_started_at ON runs(started_at);
        "#,
    ),
    (
        3,
        "image_source_metadata",
        r#"
        ALTER TABLE images ADD COLUMN source_url TEXT;
        ALTER TABLE images ADD COLUMN content_type TEXT;
        ALTER TABLE images ADD COLUMN byte_size INTEGER;
        ALTER TABLE images ADD COLUMN search_query TEXT;
        ALTER TABLE images ADD COLUMN query_tags TEXT NOT NULL DEFAULT '[]';  -- JSON array
        "#,
    ),
];
