use tracing::{info, instrument, warn};

use crate::db::{Backend, BackendError, Creation, ExistingIndex};
use crate::schema::{AdminUser, CollectionSpec, IndexSpec, Schema};

/// The step a failure happened in, used in error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Connect,
    EnsureUser,
    ListCollections,
    EnsureCollection,
    EnsureIndex,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Connect => write!(f, "connect"),
            Step::EnsureUser => write!(f, "ensure user"),
            Step::ListCollections => write!(f, "list collections"),
            Step::EnsureCollection => write!(f, "ensure collection"),
            Step::EnsureIndex => write!(f, "ensure index"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("missing or empty environment variable {variable}")]
    Configuration { variable: &'static str },
    #[error("database unavailable during step: {step}")]
    Connectivity {
        step: Step,
        #[source]
        source: BackendError,
    },
    #[error("database rejected the connection check")]
    ConnectionRejected {
        #[source]
        source: BackendError,
    },
    #[error("ensure user failed for user {username}")]
    AuthProvisioning {
        username: String,
        #[source]
        source: BackendError,
    },
    #[error("{step} failed for database {database}")]
    DatabaseProvisioning {
        step: Step,
        database: String,
        #[source]
        source: BackendError,
    },
    #[error("{step} failed for collection {collection}")]
    SchemaProvisioning {
        step: Step,
        collection: String,
        #[source]
        source: BackendError,
    },
    #[error(
        "index {index} on {collection} conflicts with existing index {existing} (declared unique: {declared_unique})"
    )]
    IndexConflict {
        collection: String,
        index: String,
        declared_unique: bool,
        existing: String,
        #[source]
        source: Option<BackendError>,
    },
}

impl ProvisionError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProvisionError::Configuration { .. } => 2,
            ProvisionError::Connectivity { .. } => 3,
            _ => 1,
        }
    }

    /// Classify a failed ping: only an unreachable server is worth retrying.
    pub fn connect(source: BackendError) -> Self {
        match source {
            BackendError::Unreachable(_) => ProvisionError::Connectivity {
                step: Step::Connect,
                source,
            },
            _ => ProvisionError::ConnectionRejected { source },
        }
    }

    fn user(username: &str, source: BackendError) -> Self {
        match source {
            BackendError::Unreachable(_) => ProvisionError::Connectivity {
                step: Step::EnsureUser,
                source,
            },
            _ => ProvisionError::AuthProvisioning {
                username: username.to_string(),
                source,
            },
        }
    }

    fn schema(step: Step, collection: &str, source: BackendError) -> Self {
        match source {
            BackendError::Unreachable(_) => ProvisionError::Connectivity { step, source },
            _ => ProvisionError::SchemaProvisioning {
                step,
                collection: collection.to_string(),
                source,
            },
        }
    }

    fn database(step: Step, database: &str, source: BackendError) -> Self {
        match source {
            BackendError::Unreachable(_) => ProvisionError::Connectivity { step, source },
            _ => ProvisionError::DatabaseProvisioning {
                step,
                database: database.to_string(),
                source,
            },
        }
    }
}

/// What a successful `provision` did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub user_created: bool,
    pub collections_created: usize,
    pub collections_existing: usize,
    pub indexes_created: usize,
    pub indexes_existing: usize,
}

impl ProvisionReport {
    /// True when the database already was in the declared state.
    pub fn is_noop(&self) -> bool {
        !self.user_created && self.collections_created == 0 && self.indexes_created == 0
    }
}

/// A difference between the live database and the declared state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Drift {
    MissingUser {
        username: String,
    },
    MissingCollection {
        collection: String,
    },
    UnexpectedCollection {
        collection: String,
    },
    MissingIndex {
        collection: String,
        index: String,
    },
    IndexConflict {
        collection: String,
        index: String,
        existing: String,
    },
    UnexpectedIndex {
        collection: String,
        index: String,
    },
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Drift::MissingUser { username } => write!(f, "user {} is missing", username),
            Drift::MissingCollection { collection } => {
                write!(f, "collection {} is missing", collection)
            }
            Drift::UnexpectedCollection { collection } => {
                write!(f, "collection {} is not declared", collection)
            }
            Drift::MissingIndex { collection, index } => {
                write!(f, "index {} on {} is missing", index, collection)
            }
            Drift::IndexConflict {
                collection,
                index,
                existing,
            } => write!(
                f,
                "index {} on {} conflicts with existing index {}",
                index, collection, existing
            ),
            Drift::UnexpectedIndex { collection, index } => {
                write!(f, "index {} on {} is not declared", index, collection)
            }
        }
    }
}

/// How a declared index relates to what is on the server.
enum IndexState<'a> {
    Present,
    Absent,
    Conflict(&'a ExistingIndex),
}

fn index_state<'a>(existing: &'a [ExistingIndex], index: &IndexSpec) -> IndexState<'a> {
    if let Some(found) = existing.iter().find(|e| e.has_keys_of(index)) {
        if found.unique == index.unique {
            return IndexState::Present;
        }
        return IndexState::Conflict(found);
    }
    // same name, different keys
    match existing.iter().find(|e| e.name == index.name()) {
        Some(found) => IndexState::Conflict(found),
        None => IndexState::Absent,
    }
}

/// The backend bound to one logical database.
struct TargetDatabase<'a, B: Backend + ?Sized> {
    backend: &'a B,
    name: &'a str,
}

impl<'a, B: Backend + ?Sized> TargetDatabase<'a, B> {
    fn select(backend: &'a B, name: &'a str) -> Self {
        TargetDatabase { backend, name }
    }

    #[instrument(skip_all, err, fields(collection = %collection.name))]
    async fn ensure_collection(
        &self,
        collection: &CollectionSpec,
        present: &[String],
        report: &mut ProvisionReport,
    ) -> Result<(), ProvisionError> {
        if present.contains(&collection.name) {
            report.collections_existing += 1;
            return Ok(());
        }
        let creation = self
            .backend
            .create_collection(self.name, &collection.name)
            .await
            .map_err(|e| ProvisionError::schema(Step::EnsureCollection, &collection.name, e))?;
        match creation {
            Creation::Created => {
                info!("created collection");
                report.collections_created += 1;
            }
            Creation::AlreadyExists => report.collections_existing += 1,
        }
        Ok(())
    }

    #[instrument(skip(self, index, report), err, fields(index = %index))]
    async fn ensure_index(
        &self,
        collection: &str,
        index: &IndexSpec,
        report: &mut ProvisionReport,
    ) -> Result<(), ProvisionError> {
        let existing = self
            .backend
            .list_indexes(self.name, collection)
            .await
            .map_err(|e| ProvisionError::schema(Step::EnsureIndex, collection, e))?;
        match index_state(&existing, index) {
            IndexState::Present => {
                report.indexes_existing += 1;
                return Ok(());
            }
            IndexState::Conflict(found) => {
                return Err(ProvisionError::IndexConflict {
                    collection: collection.to_string(),
                    index: index.to_string(),
                    declared_unique: index.unique,
                    existing: found.name.clone(),
                    source: None,
                });
            }
            IndexState::Absent => {}
        }
        let creation = match self.backend.create_index(self.name, collection, index).await {
            Ok(creation) => creation,
            Err(source @ BackendError::Conflict(_)) => {
                return Err(ProvisionError::IndexConflict {
                    collection: collection.to_string(),
                    index: index.to_string(),
                    declared_unique: index.unique,
                    existing: self.conflicting_index(collection, index).await,
                    source: Some(source),
                });
            }
            Err(source) => return Err(ProvisionError::schema(Step::EnsureIndex, collection, source)),
        };
        match creation {
            Creation::Created => {
                info!("created index");
                report.indexes_created += 1;
            }
            Creation::AlreadyExists => report.indexes_existing += 1,
        }
        Ok(())
    }

    /// Name of the index the server refused `index` over. It showed up after
    /// our listing, so list again. Empty when it cannot be told.
    async fn conflicting_index(&self, collection: &str, index: &IndexSpec) -> String {
        match self.backend.list_indexes(self.name, collection).await {
            Ok(current) => match index_state(&current, index) {
                IndexState::Conflict(found) => found.name.clone(),
                _ => String::new(),
            },
            Err(error) => {
                warn!(%error, "could not list indexes after a conflict");
                String::new()
            }
        }
    }
}

#[instrument(skip_all, err, fields(username = %credentials.username))]
async fn ensure_user<B: Backend + ?Sized>(
    backend: &B,
    credentials: &AdminUser,
    report: &mut ProvisionReport,
) -> Result<(), ProvisionError> {
    let exists = backend
        .user_exists(&credentials.auth_database, &credentials.username)
        .await
        .map_err(|e| ProvisionError::user(&credentials.username, e))?;
    if exists {
        info!("user already exists, leaving it unchanged");
        return Ok(());
    }
    let creation = backend
        .create_user(credentials)
        .await
        .map_err(|e| ProvisionError::user(&credentials.username, e))?;
    match creation {
        Creation::Created => {
            info!(role = %credentials.role, database = %credentials.target_database, "created user");
            report.user_created = true;
        }
        // created concurrently between the lookup and the create
        Creation::AlreadyExists => info!("user already exists, leaving it unchanged"),
    }
    Ok(())
}

/// Bring the database behind `backend` to the declared state: the user, then
/// every collection, then every index, in declaration order.
///
/// Every step tolerates its object already being there, so this can be re-run
/// after a partial failure. The first error aborts the remaining steps.
#[instrument(skip_all, err, fields(database = %credentials.target_database))]
pub async fn provision<B: Backend + ?Sized>(
    backend: &B,
    credentials: &AdminUser,
    schema: &Schema,
) -> Result<ProvisionReport, ProvisionError> {
    credentials.validate()?;
    let mut report = ProvisionReport::default();

    ensure_user(backend, credentials, &mut report).await?;

    let target = TargetDatabase::select(backend, &credentials.target_database);

    let present = backend
        .collection_names(target.name)
        .await
        .map_err(|e| ProvisionError::database(Step::ListCollections, target.name, e))?;
    for collection in &schema.collections {
        target
            .ensure_collection(collection, &present, &mut report)
            .await?;
    }

    for collection in &schema.collections {
        for index in &collection.indexes {
            target
                .ensure_index(&collection.name, index, &mut report)
                .await?;
        }
    }

    info!(
        user_created = report.user_created,
        collections_created = report.collections_created,
        indexes_created = report.indexes_created,
        "provisioning complete"
    );
    Ok(report)
}

/// Compare the database behind `backend` with the declared state without
/// changing anything. An empty result means the database matches exactly.
#[instrument(skip_all, err, fields(database = %credentials.target_database))]
pub async fn verify<B: Backend + ?Sized>(
    backend: &B,
    credentials: &AdminUser,
    schema: &Schema,
) -> Result<Vec<Drift>, ProvisionError> {
    credentials.validate()?;
    let mut drift = Vec::new();

    let exists = backend
        .user_exists(&credentials.auth_database, &credentials.username)
        .await
        .map_err(|e| ProvisionError::user(&credentials.username, e))?;
    if !exists {
        drift.push(Drift::MissingUser {
            username: credentials.username.clone(),
        });
    }

    let database = credentials.target_database.as_str();
    let present = backend
        .collection_names(database)
        .await
        .map_err(|e| ProvisionError::database(Step::ListCollections, database, e))?;

    for name in &present {
        if !name.starts_with("system.") && schema.collection(name).is_none() {
            drift.push(Drift::UnexpectedCollection {
                collection: name.clone(),
            });
        }
    }

    for collection in &schema.collections {
        if !present.contains(&collection.name) {
            drift.push(Drift::MissingCollection {
                collection: collection.name.clone(),
            });
            continue;
        }
        let existing = backend
            .list_indexes(database, &collection.name)
            .await
            .map_err(|e| ProvisionError::schema(Step::EnsureIndex, &collection.name, e))?;

        for index in &collection.indexes {
            match index_state(&existing, index) {
                IndexState::Present => {}
                IndexState::Absent => drift.push(Drift::MissingIndex {
                    collection: collection.name.clone(),
                    index: index.to_string(),
                }),
                IndexState::Conflict(found) => drift.push(Drift::IndexConflict {
                    collection: collection.name.clone(),
                    index: index.to_string(),
                    existing: found.name.clone(),
                }),
            }
        }

        for found in &existing {
            let declared = collection
                .indexes
                .iter()
                .any(|index| found.has_keys_of(index) || found.name == index.name());
            if !found.is_id_index() && !declared {
                drift.push(Drift::UnexpectedIndex {
                    collection: collection.name.clone(),
                    index: found.name.clone(),
                });
            }
        }
    }

    if !drift.is_empty() {
        warn!(count = drift.len(), "database differs from the declared schema");
    }
    Ok(drift)
}
