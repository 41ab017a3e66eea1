/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a node inside a job descriptor (the JSON object key).
pub type NodeId = String;
