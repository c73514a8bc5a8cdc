//! Declarative description of the state the database is brought to.
//!
//! Nothing in here talks to the database: these are plain descriptors that
//! `provision` and `verify` walk in declaration order.
use mongodb::bson::{Bson, Document};

use crate::provision::ProvisionError;

/// Logical database every collection and index lives in.
pub const TARGET_DATABASE: &str = "redsocial";

pub const USERNAME_VAR: &str = "MONGO_INITDB_ROOT_USERNAME";
pub const PASSWORD_VAR: &str = "MONGO_INITDB_ROOT_PASSWORD";

pub const TRAVEL_DETAILS: &str = "travel_details";
pub const USER_STATS: &str = "user_stats";
pub const ACTIVITY_LOGS: &str = "activity_logs";
pub const PLACE_REVIEWS: &str = "place_reviews";
pub const MEDIA_LINKS: &str = "media_links";

/// Role granted to the administrative user on the target database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    ReadWrite,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ReadWrite => "readWrite",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The administrative user to create.
///
/// The password is never part of the `Debug` output, so an `AdminUser` can be
/// handed to `tracing` fields without leaking it.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminUser {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub target_database: String,
    pub auth_database: String,
}

impl AdminUser {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        AdminUser {
            username: username.into(),
            password: password.into(),
            role: Role::default(),
            target_database: TARGET_DATABASE.to_string(),
            auth_database: TARGET_DATABASE.to_string(),
        }
    }

    /// Store the user document in `auth_database` instead of the target
    /// database. The role is still granted on the target database.
    pub fn with_auth_database(mut self, auth_database: impl Into<String>) -> Self {
        self.auth_database = auth_database.into();
        self
    }

    /// Read the credentials from `MONGO_INITDB_ROOT_USERNAME` and
    /// `MONGO_INITDB_ROOT_PASSWORD`.
    pub fn from_env() -> Result<Self, ProvisionError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, with the variables resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProvisionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = lookup(USERNAME_VAR).unwrap_or_default();
        let password = lookup(PASSWORD_VAR).unwrap_or_default();
        let user = AdminUser::new(username, password);
        user.validate()?;
        Ok(user)
    }

    /// Both the username and the password must be non-empty.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.username.is_empty() {
            return Err(ProvisionError::Configuration {
                variable: USERNAME_VAR,
            });
        }
        if self.password.is_empty() {
            return Err(ProvisionError::Configuration {
                variable: PASSWORD_VAR,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AdminUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("role", &self.role)
            .field("target_database", &self.target_database)
            .field("auth_database", &self.auth_database)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i32(&self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }

    /// Interpret a key value as reported by the server. Only plain numeric
    /// `1` / `-1` count; `"text"`, `"2dsphere"`, `"hashed"` and friends do not.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        let value = match value {
            Bson::Int32(v) => *v as f64,
            Bson::Int64(v) => *v as f64,
            Bson::Double(v) => *v,
            _ => return None,
        };
        if value == 1.0 {
            Some(Direction::Ascending)
        } else if value == -1.0 {
            Some(Direction::Descending)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexKey {
    pub field: String,
    pub direction: Direction,
}

impl IndexKey {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        IndexKey {
            field: field.into(),
            direction,
        }
    }
}

/// A secondary index. Its identity within a collection is the ordered list of
/// keys; `unique` is an attribute that must agree with whatever is already on
/// the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    pub keys: Vec<IndexKey>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(keys: Vec<IndexKey>) -> Self {
        IndexSpec {
            keys,
            unique: false,
        }
    }

    pub fn ascending(field: &str) -> Self {
        Self::new(vec![IndexKey::new(field, Direction::Ascending)])
    }

    pub fn descending(field: &str) -> Self {
        Self::new(vec![IndexKey::new(field, Direction::Descending)])
    }

    pub fn compound(keys: &[(&str, Direction)]) -> Self {
        Self::new(
            keys.iter()
                .map(|(field, direction)| IndexKey::new(*field, *direction))
                .collect(),
        )
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Key document in declaration order, e.g. `{ "reference_id": 1, "reference_type": 1 }`.
    pub fn keys_document(&self) -> Document {
        let mut keys = Document::new();
        for key in &self.keys {
            keys.insert(key.field.clone(), key.direction.as_i32());
        }
        keys
    }

    /// The name the server would generate for these keys (`user_id_1`,
    /// `created_at_-1`, ...).
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|key| format!("{}_{}", key.field, key.direction.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl std::fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .keys
            .iter()
            .map(|key| format!("{}: {}", key.field, key.direction.as_i32()))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{{}}}", keys)?;
        if self.unique {
            write!(f, " unique")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionSpec {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Ordered collections (each with its indexes) to create in the target
/// database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    pub collections: Vec<CollectionSpec>,
}

impl Schema {
    pub fn new(collections: Vec<CollectionSpec>) -> Self {
        Schema { collections }
    }

    /// The fixed redsocial declaration.
    pub fn redsocial() -> Self {
        Schema::new(vec![
            CollectionSpec::new(TRAVEL_DETAILS)
                .with_index(IndexSpec::ascending("user_id"))
                .with_index(IndexSpec::descending("created_at")),
            CollectionSpec::new(USER_STATS).with_index(IndexSpec::ascending("user_id").unique()),
            CollectionSpec::new(ACTIVITY_LOGS)
                .with_index(IndexSpec::ascending("user_id"))
                .with_index(IndexSpec::descending("timestamp")),
            CollectionSpec::new(PLACE_REVIEWS)
                .with_index(IndexSpec::ascending("place_id"))
                .with_index(IndexSpec::ascending("user_id"))
                .with_index(IndexSpec::descending("created_at")),
            CollectionSpec::new(MEDIA_LINKS).with_index(
                IndexSpec::compound(&[
                    ("reference_id", Direction::Ascending),
                    ("reference_type", Direction::Ascending),
                ])
                .unique(),
            ),
        ])
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.iter().map(|c| c.name.as_str()).collect()
    }
}
