//! Database schema for the stack store

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS dialog_stacks (
    address TEXT NOT NULL,
    stack_id TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (address, stack_id)
);

CREATE INDEX IF NOT EXISTS idx_dialog_stacks_updated ON dialog_stacks(updated_at DESC);
";
