//! pgoutput v1 message bodies
//!
//! Wire-shape structs for the logical replication messages this crate
//! consumes. Field order mirrors the on-wire layout documented in the
//! PostgreSQL logical replication message format.

use bytes::Bytes;

/// One parsed pgoutput message.
#[derive(Debug, Clone)]
pub enum ReplicationMessage {
    /// Transaction begin
    Begin(BeginBody),
    /// Transaction commit
    Commit(CommitBody),
    /// Replication origin
    Origin(OriginBody),
    /// Relation (table) schema
    Relation(RelationBody),
    /// Custom type definition
    Type(TypeBody),
    /// Row insert
    Insert(InsertBody),
    /// Row update
    Update(UpdateBody),
    /// Row delete
    Delete(DeleteBody),
    /// Table truncate
    Truncate(TruncateBody),
}

/// BEGIN: opens a transaction. `timestamp` is microseconds since the
/// PostgreSQL epoch and carries the commit time of the transaction.
#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: u64,
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT: closes the transaction opened by the matching BEGIN.
#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

/// ORIGIN: upstream origin of the following changes.
#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: u64,
    pub name: String,
}

/// RELATION: table schema, sent before the first row message touching the
/// relation in a session and again whenever the schema changes.
#[derive(Debug, Clone)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

impl RelationBody {
    /// Names of the columns that form the replica identity (usually the
    /// primary key).
    pub fn key_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// One column within a [`RelationBody`].
#[derive(Debug, Clone)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    pub type_id: i32,
    pub type_mode: i32,
}

impl Column {
    /// Bit 0 of `flags` marks membership in the replica identity.
    pub fn is_key(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// TYPE: definition of a non-builtin column type.
#[derive(Debug, Clone)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

/// INSERT: new row image.
#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

/// UPDATE: new row image plus, depending on the table's replica identity,
/// the old key tuple (`K` form) or the full old row (`O` form).
#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

/// DELETE: old key tuple or full old row, never a new image.
#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Tuple,
}

/// TRUNCATE: affected relation OIDs plus cascade/restart-identity options.
#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub relation_ids: Vec<u32>,
    pub options: u8,
}

/// Column values of one row image.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// A single column value within a [`Tuple`].
#[derive(Debug, Clone)]
pub enum TupleData {
    /// SQL NULL
    Null,
    /// Unchanged TOASTed value, not transmitted
    Toast,
    /// Text-format representation of the value
    Text(Bytes),
}
