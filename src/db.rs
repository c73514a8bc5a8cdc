// Database related functionality
use futures::TryStreamExt;
use mongodb::bson::{Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, IndexModel};
use tracing::{debug, instrument};

use crate::schema::{AdminUser, Direction, IndexKey, IndexSpec};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server error codes the provisioner cares about.
pub mod codes {
    pub const DUPLICATE_KEY: i32 = 11000;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const NAMESPACE_EXISTS: i32 = 48;
    pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
    pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
    pub const USER_ALREADY_EXISTS: i32 = 51003;
}

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("database is unreachable")]
    Unreachable(#[source] BoxError),
    #[error("server reported an index conflict")]
    Conflict(#[source] BoxError),
    #[error("database command failed")]
    Command(#[source] BoxError),
}

impl From<mongodb::error::Error> for BackendError {
    fn from(error: mongodb::error::Error) -> Self {
        if is_unreachable(&error) {
            return BackendError::Unreachable(Box::new(error));
        }
        match error_code(&error) {
            Some(codes::INDEX_OPTIONS_CONFLICT) | Some(codes::INDEX_KEY_SPECS_CONFLICT) => {
                BackendError::Conflict(Box::new(error))
            }
            _ => BackendError::Command(Box::new(error)),
        }
    }
}

impl From<mongodb::bson::document::ValueAccessError> for BackendError {
    fn from(error: mongodb::bson::document::ValueAccessError) -> Self {
        BackendError::Command(Box::new(error))
    }
}

/// Server error code carried by a command or write error, if any.
pub fn error_code(error: &mongodb::error::Error) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(command_error) => Some(command_error.code),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => Some(write_error.code),
        _ => None,
    }
}

fn is_unreachable(error: &mongodb::error::Error) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. }
    )
}

/// Outcome of an idempotent create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Creation {
    Created,
    AlreadyExists,
}

/// An index as reported by `listIndexes`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExistingIndex {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl ExistingIndex {
    pub const ID_INDEX_NAME: &'static str = "_id_";

    pub fn from_spec(index: &IndexSpec) -> Self {
        ExistingIndex {
            name: index.name(),
            keys: index.keys_document(),
            unique: index.unique,
        }
    }

    pub fn from_model(model: IndexModel) -> Self {
        let (name, unique) = match &model.options {
            Some(options) => (
                options.name.clone().unwrap_or_default(),
                options.unique.unwrap_or(false),
            ),
            None => (String::new(), false),
        };
        ExistingIndex {
            name,
            keys: model.keys,
            unique,
        }
    }

    /// The keys as an ordered list, or `None` when any key is not a plain
    /// ascending/descending one.
    pub fn key_list(&self) -> Option<Vec<IndexKey>> {
        self.keys
            .iter()
            .map(|(field, value)| {
                Direction::from_bson(value).map(|direction| IndexKey::new(field.clone(), direction))
            })
            .collect()
    }

    /// Same identity: identical keys in identical order.
    pub fn has_keys_of(&self, index: &IndexSpec) -> bool {
        self.key_list().is_some_and(|keys| keys == index.keys)
    }

    pub fn is_id_index(&self) -> bool {
        self.name == Self::ID_INDEX_NAME
    }
}

/// Everything the provisioner needs from a database server. Create operations
/// report `Creation::AlreadyExists` instead of failing when the object is
/// already there.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> Result<(), BackendError>;
    async fn user_exists(&self, auth_database: &str, username: &str)
    -> Result<bool, BackendError>;
    async fn create_user(&self, user: &AdminUser) -> Result<Creation, BackendError>;
    async fn collection_names(&self, database: &str) -> Result<Vec<String>, BackendError>;
    async fn create_collection(&self, database: &str, name: &str)
    -> Result<Creation, BackendError>;
    async fn list_indexes(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Vec<ExistingIndex>, BackendError>;
    async fn create_index(
        &self,
        database: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> Result<Creation, BackendError>;
}

/// `Backend` over the official MongoDB driver.
#[derive(Clone, Debug)]
pub struct MongoBackend {
    client: Client,
}

impl MongoBackend {
    pub fn new(client: Client) -> Self {
        MongoBackend { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait::async_trait]
impl Backend for MongoBackend {
    #[instrument(skip(self), err)]
    async fn ping(&self) -> Result<(), BackendError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn user_exists(
        &self,
        auth_database: &str,
        username: &str,
    ) -> Result<bool, BackendError> {
        let reply = self
            .client
            .database(auth_database)
            .run_command(doc! { "usersInfo": username })
            .await?;
        let users = reply.get_array("users")?;
        Ok(!users.is_empty())
    }

    #[instrument(skip_all, err, fields(username = %user.username, auth_database = %user.auth_database))]
    async fn create_user(&self, user: &AdminUser) -> Result<Creation, BackendError> {
        let command = doc! {
            "createUser": user.username.as_str(),
            "pwd": user.password.as_str(),
            "roles": [
                { "role": user.role.as_str(), "db": user.target_database.as_str() }
            ],
        };
        match self
            .client
            .database(&user.auth_database)
            .run_command(command)
            .await
        {
            Ok(_) => Ok(Creation::Created),
            Err(error)
                if matches!(
                    error_code(&error),
                    Some(codes::USER_ALREADY_EXISTS) | Some(codes::DUPLICATE_KEY)
                ) =>
            {
                debug!("user already exists");
                Ok(Creation::AlreadyExists)
            }
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip(self), err)]
    async fn collection_names(&self, database: &str) -> Result<Vec<String>, BackendError> {
        let names = self
            .client
            .database(database)
            .list_collection_names()
            .await?;
        Ok(names)
    }

    #[instrument(skip(self), err)]
    async fn create_collection(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Creation, BackendError> {
        match self.client.database(database).create_collection(name).await {
            Ok(()) => Ok(Creation::Created),
            Err(error) if error_code(&error) == Some(codes::NAMESPACE_EXISTS) => {
                debug!("collection already exists");
                Ok(Creation::AlreadyExists)
            }
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_indexes(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Vec<ExistingIndex>, BackendError> {
        let collection = self
            .client
            .database(database)
            .collection::<Document>(collection);
        let cursor = match collection.list_indexes().await {
            Ok(cursor) => cursor,
            Err(error) if error_code(&error) == Some(codes::NAMESPACE_NOT_FOUND) => {
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };
        let models: Vec<IndexModel> = cursor.try_collect().await?;
        Ok(models.into_iter().map(ExistingIndex::from_model).collect())
    }

    #[instrument(skip(self, index), err, fields(index = %index.name()))]
    async fn create_index(
        &self,
        database: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> Result<Creation, BackendError> {
        let collection = self
            .client
            .database(database)
            .collection::<Document>(collection);
        let index_model = IndexModel::builder()
            .keys(index.keys_document())
            .options(
                IndexOptions::builder()
                    .name(index.name())
                    .unique(index.unique)
                    .build(),
            )
            .build();
        collection.create_index(index_model).await?;
        Ok(Creation::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Bson;

    #[test]
    fn test_key_list() {
        let index = ExistingIndex {
            name: "reference_id_1_reference_type_1".to_string(),
            keys: doc! { "reference_id": 1i64, "reference_type": 1.0 },
            unique: true,
        };
        assert_eq!(
            index.key_list(),
            Some(vec![
                IndexKey::new("reference_id", Direction::Ascending),
                IndexKey::new("reference_type", Direction::Ascending),
            ])
        );

        let text = ExistingIndex {
            name: "bio_text".to_string(),
            keys: doc! { "bio": "text" },
            unique: false,
        };
        assert_eq!(text.key_list(), None);
        assert!(!text.has_keys_of(&IndexSpec::ascending("bio")));
    }

    #[test]
    fn test_identity_is_order_sensitive() {
        let declared = IndexSpec::compound(&[
            ("reference_id", Direction::Ascending),
            ("reference_type", Direction::Ascending),
        ]);
        let swapped = ExistingIndex {
            name: "reference_type_1_reference_id_1".to_string(),
            keys: doc! { "reference_type": 1, "reference_id": 1 },
            unique: true,
        };
        assert!(!swapped.has_keys_of(&declared));
        assert!(ExistingIndex::from_spec(&declared).has_keys_of(&declared));
    }

    #[test]
    fn test_from_model() {
        let model = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_id_1".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        let index = ExistingIndex::from_model(model);
        assert_eq!(index.name, "user_id_1");
        assert!(index.unique);
        assert_eq!(index.keys.get("user_id"), Some(&Bson::Int32(1)));

        let bare = ExistingIndex::from_model(IndexModel::builder().keys(doc! { "_id": 1 }).build());
        assert_eq!(bare.name, "");
        assert!(!bare.unique);
    }
}
