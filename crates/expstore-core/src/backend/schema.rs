pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
  path TEXT NOT NULL,
  id TEXT NOT NULL,
  shard_hash INTEGER NOT NULL,
  data TEXT NOT NULL,
  PRIMARY KEY (path, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_shard ON documents(path, shard_hash);
"#;
