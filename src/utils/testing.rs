// In-memory stand-in for a MongoDB server, used by the tests.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mongodb::bson::{Bson, Document, oid::ObjectId};

use crate::db::{Backend, BackendError, Creation, ExistingIndex};
use crate::schema::{AdminUser, IndexSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    UserExists,
    CreateUser,
    CollectionNames,
    CreateCollection,
    ListIndexes,
    CreateIndex,
}

/// A user as stored by the server: password and (role, database) grants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUser {
    pub password: String,
    pub roles: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug)]
enum Failure {
    Unreachable,
    Command,
}

#[derive(Debug)]
struct StoredCollection {
    indexes: Vec<ExistingIndex>,
    documents: Vec<Document>,
}

impl StoredCollection {
    fn new() -> Self {
        StoredCollection {
            indexes: vec![ExistingIndex {
                name: ExistingIndex::ID_INDEX_NAME.to_string(),
                keys: mongodb::bson::doc! { "_id": 1 },
                unique: false,
            }],
            documents: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<(String, String), StoredUser>,
    databases: BTreeMap<String, BTreeMap<String, StoredCollection>>,
    failures: HashMap<Operation, Failure>,
    stale: HashSet<Operation>,
    mutations: Vec<String>,
}

impl State {
    fn check(&self, operation: Operation) -> Result<(), BackendError> {
        match self.failures.get(&operation) {
            None => Ok(()),
            Some(Failure::Unreachable) => Err(BackendError::Unreachable(
                format!("server selection timed out during {:?}", operation).into(),
            )),
            Some(Failure::Command) => Err(BackendError::Command(
                format!("{:?} rejected by the server", operation).into(),
            )),
        }
    }

    fn collection_mut(&mut self, database: &str, collection: &str) -> &mut StoredCollection {
        self.databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_insert_with(StoredCollection::new)
    }
}

/// A `Backend` that keeps everything in memory and behaves like the server
/// for the commands the provisioner issues: "already exists" outcomes,
/// index conflicts, implicit collection creation on index creation and
/// unique index enforcement on insert.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later call of `operation` fail with a command error.
    pub fn fail_on(&self, operation: Operation) {
        self.state().failures.insert(operation, Failure::Command);
    }

    /// Make every later call of `operation` fail as if the server was gone.
    pub fn unreachable_on(&self, operation: Operation) {
        self.state().failures.insert(operation, Failure::Unreachable);
    }

    /// Make the next lookup of `operation` answer as if nothing existed yet,
    /// like a listing taken just before another client created the objects.
    pub fn miss_next(&self, operation: Operation) {
        self.state().stale.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Put an index on the server as-is, bypassing the conflict checks of
    /// `create_index`. Not recorded as a mutation.
    pub fn add_index(&self, database: &str, collection: &str, index: ExistingIndex) {
        self.state()
            .collection_mut(database, collection)
            .indexes
            .push(index);
    }

    /// Every mutating command that changed state, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn user(&self, auth_database: &str, username: &str) -> Option<StoredUser> {
        self.state()
            .users
            .get(&(auth_database.to_string(), username.to_string()))
            .cloned()
    }

    /// Sorted collection names of `database`.
    pub fn collections(&self, database: &str) -> Vec<String> {
        self.state()
            .databases
            .get(database)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn indexes(&self, database: &str, collection: &str) -> Vec<ExistingIndex> {
        self.state()
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    pub fn count_documents(&self, database: &str, collection: &str) -> usize {
        self.state()
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }

    /// Insert a document, failing with a duplicate key error when the `_id`
    /// or any unique index would be violated.
    pub fn insert(
        &self,
        database: &str,
        collection: &str,
        mut document: Document,
    ) -> Result<(), BackendError> {
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        let mut state = self.state();
        let stored = state.collection_mut(database, collection);

        for index in &stored.indexes {
            if !index.unique && !index.is_id_index() {
                continue;
            }
            let key = key_values(&index.keys, &document);
            if stored
                .documents
                .iter()
                .any(|other| key_values(&index.keys, other) == key)
            {
                return Err(BackendError::Command(
                    format!(
                        "E11000 duplicate key error collection: {}.{} index: {}",
                        database, collection, index.name
                    )
                    .into(),
                ));
            }
        }
        stored.documents.push(document);
        Ok(())
    }
}

fn key_values(keys: &Document, document: &Document) -> Vec<Bson> {
    keys.keys()
        .map(|field| document.get(field).cloned().unwrap_or(Bson::Null))
        .collect()
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.state().check(Operation::Ping)
    }

    async fn user_exists(
        &self,
        auth_database: &str,
        username: &str,
    ) -> Result<bool, BackendError> {
        let mut state = self.state();
        state.check(Operation::UserExists)?;
        if state.stale.remove(&Operation::UserExists) {
            return Ok(false);
        }
        Ok(state
            .users
            .contains_key(&(auth_database.to_string(), username.to_string())))
    }

    async fn create_user(&self, user: &AdminUser) -> Result<Creation, BackendError> {
        let mut state = self.state();
        state.check(Operation::CreateUser)?;
        let key = (user.auth_database.clone(), user.username.clone());
        if state.users.contains_key(&key) {
            return Ok(Creation::AlreadyExists);
        }
        state.users.insert(
            key,
            StoredUser {
                password: user.password.clone(),
                roles: vec![(user.role.as_str().to_string(), user.target_database.clone())],
            },
        );
        state
            .mutations
            .push(format!("createUser {}.{}", user.auth_database, user.username));
        Ok(Creation::Created)
    }

    async fn collection_names(&self, database: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state();
        state.check(Operation::CollectionNames)?;
        if state.stale.remove(&Operation::CollectionNames) {
            return Ok(Vec::new());
        }
        Ok(state
            .databases
            .get(database)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Creation, BackendError> {
        let mut state = self.state();
        state.check(Operation::CreateCollection)?;
        let collections = state.databases.entry(database.to_string()).or_default();
        if collections.contains_key(name) {
            return Ok(Creation::AlreadyExists);
        }
        collections.insert(name.to_string(), StoredCollection::new());
        state.mutations.push(format!("create {}.{}", database, name));
        Ok(Creation::Created)
    }

    async fn list_indexes(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Vec<ExistingIndex>, BackendError> {
        let mut state = self.state();
        state.check(Operation::ListIndexes)?;
        if state.stale.remove(&Operation::ListIndexes) {
            return Ok(Vec::new());
        }
        Ok(state
            .databases
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_index(
        &self,
        database: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> Result<Creation, BackendError> {
        let mut state = self.state();
        state.check(Operation::CreateIndex)?;
        let requested = ExistingIndex::from_spec(index);
        let stored = state.collection_mut(database, collection);

        if let Some(found) = stored
            .indexes
            .iter()
            .find(|e| e.name == requested.name || e.has_keys_of(index))
        {
            if *found == requested {
                return Ok(Creation::AlreadyExists);
            }
            return Err(BackendError::Conflict(
                format!(
                    "Index already exists with different options: {} ({})",
                    found.name, index
                )
                .into(),
            ));
        }
        stored.indexes.push(requested);
        state.mutations.push(format!(
            "createIndexes {}.{} {}",
            database,
            collection,
            index.name()
        ));
        Ok(Creation::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[tokio::test]
    async fn test_create_index_conflicts_like_the_server() {
        let backend = MemoryBackend::new();
        let plain = IndexSpec::ascending("user_id");
        assert_eq!(
            backend.create_index("db", "c", &plain).await.unwrap(),
            Creation::Created
        );
        assert_eq!(
            backend.create_index("db", "c", &plain).await.unwrap(),
            Creation::AlreadyExists
        );
        let unique = IndexSpec::ascending("user_id").unique();
        assert!(matches!(
            backend.create_index("db", "c", &unique).await,
            Err(BackendError::Conflict(_))
        ));
        // implicit collection creation, with its _id index
        assert_eq!(backend.collections("db"), vec!["c".to_string()]);
        assert_eq!(backend.indexes("db", "c").len(), 2);
    }

    #[tokio::test]
    async fn test_insert_enforces_id_and_unique_indexes() {
        let backend = MemoryBackend::new();
        backend
            .create_index("db", "c", &IndexSpec::ascending("email").unique())
            .await
            .unwrap();
        backend.insert("db", "c", doc! { "_id": 1, "email": "a" }).unwrap();
        assert!(backend.insert("db", "c", doc! { "_id": 1, "email": "b" }).is_err());
        assert!(backend.insert("db", "c", doc! { "email": "a" }).is_err());
        backend.insert("db", "c", doc! { "email": "b" }).unwrap();
        assert_eq!(backend.count_documents("db", "c"), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        backend.unreachable_on(Operation::Ping);
        assert!(matches!(
            backend.ping().await,
            Err(BackendError::Unreachable(_))
        ));
        backend.clear_failures();
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_miss_next_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.create_collection("db", "c").await.unwrap();
        backend.miss_next(Operation::CollectionNames);
        assert!(backend.collection_names("db").await.unwrap().is_empty());
        assert_eq!(
            backend.collection_names("db").await.unwrap(),
            vec!["c".to_string()]
        );
    }
}
