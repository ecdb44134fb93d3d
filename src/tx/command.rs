//! Mutation commands executed by a session.

use std::sync::Arc;

use smallvec::{SmallVec, smallvec};

use crate::model::{Identity, Value};
use crate::schema::SchemaInfo;

/// One graph mutation. Sessions apply commands in order; each one runs under
/// Exclusive locks on its `lock_keys`.
#[derive(Debug, Clone)]
pub enum Command {
    AddEntity {
        id: Identity,
        schema: Arc<SchemaInfo>,
    },
    RemoveEntity {
        id: Identity,
        throw_if_not_exists: bool,
    },
    AddRelationship {
        id: Identity,
        schema: Arc<SchemaInfo>,
        start: Identity,
        start_schema: Arc<SchemaInfo>,
        end: Identity,
        end_schema: Arc<SchemaInfo>,
    },
    RemoveRelationship {
        id: Identity,
        throw_if_not_exists: bool,
    },
    ChangePropertyValue {
        owner: Identity,
        property: String,
        value: Value,
        /// Optimistic check against the stored version.
        expected_version: Option<u64>,
    },
}

impl Command {
    /// The element the command creates, removes or modifies.
    pub fn target(&self) -> &Identity {
        match self {
            Command::AddEntity { id, .. }
            | Command::RemoveEntity { id, .. }
            | Command::AddRelationship { id, .. }
            | Command::RemoveRelationship { id, .. } => id,
            Command::ChangePropertyValue { owner, .. } => owner,
        }
    }

    /// Lock resource keys. A new relationship also locks both of its ends so
    /// that concurrent removal of an end cannot interleave.
    pub fn lock_keys(&self) -> SmallVec<[String; 3]> {
        match self {
            Command::AddRelationship { id, start, end, .. } => {
                smallvec![id.to_string(), start.to_string(), end.to_string()]
            }
            other => smallvec![other.target().to_string()],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::AddEntity { .. } => "AddEntity",
            Command::RemoveEntity { .. } => "RemoveEntity",
            Command::AddRelationship { .. } => "AddRelationship",
            Command::RemoveRelationship { .. } => "RemoveRelationship",
            Command::ChangePropertyValue { .. } => "ChangePropertyValue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cardinality, SchemaBuilder};

    #[test]
    fn test_lock_keys() {
        let schema = SchemaBuilder::new("lib")
            .entity("A", |e| e)
            .relationship("AtoA", "A", "A", Cardinality::ManyToMany, |r| r)
            .compile(None)
            .unwrap();
        let a = schema.get("A").unwrap();
        let cmd = Command::AddRelationship {
            id: Identity::new("lib", "r"),
            schema: schema.get("AtoA").unwrap(),
            start: Identity::new("lib", "1"),
            start_schema: a.clone(),
            end: Identity::new("lib", "2"),
            end_schema: a,
        };
        assert_eq!(cmd.lock_keys().as_slice(), ["lib:r", "lib:1", "lib:2"]);

        let cmd = Command::ChangePropertyValue {
            owner: Identity::new("lib", "1"),
            property: "Name".into(),
            value: Value::from("x"),
            expected_version: None,
        };
        assert_eq!(cmd.lock_keys().as_slice(), ["lib:1"]);
        assert_eq!(cmd.target(), &Identity::new("lib", "1"));
    }
}
