//! The store: schemas, domains, sessions and the shared services they use.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::cache::ReadView;
use crate::calculated::CalculatedGraph;
use crate::config::{DomainConfig, SessionOptions, StoreConfig};
use crate::domain::DomainModel;
use crate::lock::{LockHandle, LockManager, LockType};
use crate::model::{Element, Identity, PropertyKey, PropertyValue, Value};
use crate::schema::{Schema, SchemaDefinition, SchemaInfo, SchemaRegistry};
use crate::storage::{HypergraphStorage, MemoryHypergraph};
use crate::tx::session::SessionTx;
use crate::tx::{Command, Diagnostic, DomainEvent, Session, SessionCompletion, StoreEvents, TxId};
use crate::{Error, Result};

/// Entry point: owns schemas, domains and the per-thread session registry.
pub struct Store<B: HypergraphStorage = MemoryHypergraph> {
    config: StoreConfig,
    schemas: SchemaRegistry,
    domains: RwLock<HashMap<String, Arc<DomainModel<B>>>>,
    default_domain: RwLock<Option<String>>,
    locks: Arc<LockManager>,
    events: Arc<StoreEvents>,
    calculated: Arc<CalculatedGraph>,
    /// Active root transaction per thread.
    active: Mutex<HashMap<thread::ThreadId, Arc<SessionTx<B>>>>,
    next_tx: AtomicU64,
}

impl<B: HypergraphStorage> std::fmt::Debug for Store<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("schemas", &self.schemas.len())
            .field("domains", &self.domains.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// In-memory store for testing and embedding.
impl Store<MemoryHypergraph> {
    pub fn open_memory() -> Self {
        Self::build(StoreConfig::default())
    }
}

impl<B: HypergraphStorage> Store<B> {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: StoreConfig) -> Self {
        let events = Arc::new(StoreEvents::new());
        let publisher = events.clone();
        let calculated = Arc::new(CalculatedGraph::new(Arc::new(move |key: &PropertyKey| {
            publisher.publish_property_changed(key)
        })));
        Self {
            config,
            schemas: SchemaRegistry::new(),
            domains: RwLock::new(HashMap::new()),
            default_domain: RwLock::new(None),
            locks: Arc::new(LockManager::new()),
            events,
            calculated,
            active: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn events(&self) -> &StoreEvents {
        &self.events
    }

    pub fn calculated(&self) -> &CalculatedGraph {
        &self.calculated
    }

    /// Log `diagnostic` and hand it to the error notifiers.
    pub fn report(&self, diagnostic: Diagnostic) {
        self.events.report(diagnostic);
    }

    fn next_tx_id(&self) -> TxId {
        TxId(self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Schemas
    // ========================================================================

    /// Compile and register a schema once. Concurrent loads of the same
    /// schema serialize on an `ExclusiveWait` lock; the loser gets the
    /// winner's instance.
    pub fn load_schema(&self, definition: SchemaDefinition) -> Result<Arc<Schema>> {
        let name = definition.namespace();
        if let Some(schema) = self.schemas.get(&name) {
            return Ok(schema);
        }

        let owner = self.next_tx_id();
        let key = format!("$schema:{name}");
        let lock = self.locks.acquire(owner, &key, LockType::ExclusiveWait, self.config.session.timeout)?;
        let _guard = LockHandle::new(self.locks.clone(), lock, key, LockType::ExclusiveWait);
        if let Some(schema) = self.schemas.get(&name) {
            return Ok(schema);
        }

        let schema = self.schemas.register(definition.compile(Some(&self.schemas))?);
        info!(schema = %name, elements = schema.len(), "schema loaded");
        Ok(schema)
    }

    /// Register an already compiled schema. Returns the registered instance.
    pub fn register_schema(&self, schema: Schema) -> Arc<Schema> {
        self.schemas.register(schema)
    }

    /// Resolve `"schema:Name"`.
    pub fn get_schema_info(&self, name: &str) -> Result<Arc<SchemaInfo>> {
        self.schemas.resolve_name(name)
    }

    // ========================================================================
    // Domains
    // ========================================================================

    /// Create and load a domain. The first domain becomes the default one.
    pub fn create_domain_model(
        &self,
        name: &str,
        config: Option<DomainConfig>,
    ) -> Result<Arc<DomainModel<B>>> {
        let name = name.to_lowercase();
        if name.is_empty() || name.contains(':') {
            return Err(Error::InvalidIdentity(name));
        }
        let domain = {
            let mut domains = self.domains.write();
            if domains.contains_key(&name) {
                return Err(Error::ConstraintViolation(format!("domain {name} is already loaded")));
            }
            let domain = Arc::new(DomainModel::new(&name, config.unwrap_or_else(|| self.config.domain.clone()))?);
            domain.attach(&self.events);
            domains.insert(name.clone(), domain.clone());
            domain
        };
        self.default_domain.write().get_or_insert_with(|| name.clone());
        info!(domain = %name, "domain loaded");
        self.events.publish_domain_loaded(&name);
        Ok(domain)
    }

    /// Unload a domain. Its cached elements are disposed and report
    /// `UnloadedDomain` afterwards.
    pub fn unload_domain(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        let domain = self
            .domains
            .write()
            .remove(&name)
            .ok_or_else(|| Error::UnloadedDomain(name.clone()))?;
        domain.detach(&self.events);
        self.calculated.dispose_domain(&name);
        {
            let mut default = self.default_domain.write();
            if default.as_deref() == Some(name.as_str()) {
                *default = None;
            }
        }
        self.events.publish_domain_unloaded(&name);
        Ok(())
    }

    /// A loaded domain, or `UnloadedDomain`.
    pub fn domain(&self, name: &str) -> Result<Arc<DomainModel<B>>> {
        self.find_domain(name).ok_or_else(|| Error::UnloadedDomain(name.to_string()))
    }

    pub(crate) fn find_domain(&self, name: &str) -> Option<Arc<DomainModel<B>>> {
        let domains = self.domains.read();
        domains.get(name).or_else(|| domains.get(&name.to_lowercase())).cloned()
    }

    pub fn default_domain_name(&self) -> Option<String> {
        self.default_domain.read().clone()
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn active_tx(&self) -> Option<Arc<SessionTx<B>>> {
        self.active
            .lock()
            .get(&thread::current().id())
            .filter(|tx| !tx.state().is_terminal())
            .cloned()
    }

    pub(crate) fn unregister(&self, tx: &SessionTx<B>) {
        let mut active = self.active.lock();
        if active.get(&tx.thread()).is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), tx)) {
            active.remove(&tx.thread());
        }
    }

    /// Open a session on the calling thread. Nested if one is already active.
    pub fn begin_session(&self, options: Option<SessionOptions>) -> Result<Session<'_, B>> {
        if let Some(tx) = self.active_tx() {
            let depth = tx.enter();
            debug!(session = %tx.id(), depth, "nested session");
            return Ok(Session::new(self, tx, depth));
        }

        let config = options.unwrap_or_default().resolve(&self.config.session);
        let tx = Arc::new(SessionTx::new(self.next_tx_id(), config));

        for handler in self.events.session_created.snapshot() {
            if let Err(e) = handler(tx.hooks()) {
                self.report(Diagnostic::new(Some(tx.id()), e.to_string()));
            }
        }
        // Runs after every subscriber's hook, so caches are settled first.
        let calculated = self.calculated.clone();
        let events = self.events.clone();
        tx.hooks().on_completing(Arc::new(move |completion: &SessionCompletion<'_>| {
            calculated.discard_scope(completion.session);
            if completion.aborted {
                return Ok(());
            }
            for event in completion.events {
                match event {
                    DomainEvent::PropertyChanged { owner, property, .. } => {
                        let key = PropertyKey::new(owner.clone(), property.clone());
                        if !calculated.notify(&key) {
                            events.publish_property_changed(&key);
                        }
                    }
                    DomainEvent::EntityRemoved { id, .. } | DomainEvent::RelationshipRemoved { id, .. } => {
                        calculated.dispose_element(id);
                    }
                    _ => {}
                }
            }
            Ok(())
        }));

        tx.activate();
        self.active.lock().insert(tx.thread(), tx.clone());
        debug!(session = %tx.id(), "session started");
        Ok(Session::new(self, tx, 1))
    }

    /// Run `commands` in the calling thread's active session.
    pub fn execute(&self, commands: impl IntoIterator<Item = Command>) -> Result<()> {
        self.require_tx("execute")?.execute(self, commands)
    }

    fn require_tx(&self, operation: &str) -> Result<Arc<SessionTx<B>>> {
        self.active_tx().ok_or_else(|| Error::SessionRequired(operation.to_string()))
    }

    /// `Session::create_entity` on the calling thread's active session.
    pub fn create_entity(&self, schema: &Arc<SchemaInfo>, id: Option<Identity>) -> Result<Arc<Element>> {
        self.require_tx("create_entity")?.create_entity(self, schema, id)
    }

    /// `Session::create_relationship` on the calling thread's active session.
    pub fn create_relationship(
        &self,
        schema: &Arc<SchemaInfo>,
        start: &Identity,
        start_schema: &Arc<SchemaInfo>,
        end: &Identity,
        end_schema: &Arc<SchemaInfo>,
        id: Option<Identity>,
    ) -> Result<Arc<Element>> {
        self.require_tx("create_relationship")?
            .create_relationship(self, schema, start, start_schema, end, end_schema, id)
    }

    pub fn remove_element(&self, id: &Identity, throw_if_not_exists: bool) -> Result<()> {
        self.require_tx("remove_element")?.remove_element(self, id, throw_if_not_exists)
    }

    pub fn set_property_value(&self, owner: &Identity, property: &str, value: impl Into<Value>) -> Result<()> {
        self.execute([Command::ChangePropertyValue {
            owner: owner.clone(),
            property: property.to_string(),
            value: value.into(),
            expected_version: None,
        }])
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Resolve an element through its domain's L1 cache, seen from the
    /// calling thread's active session if there is one.
    pub fn get_element(
        &self,
        id: &Identity,
        schema: Option<&SchemaInfo>,
        local_only: bool,
    ) -> Result<Option<Arc<Element>>> {
        if let Some(tx) = self.active_tx() {
            return tx.get_element(self, id, schema, local_only);
        }
        let domain = self.domain(id.domain())?;
        domain
            .cache()
            .get_element(domain.storage(), domain.link(), ReadView::committed(), id, schema, local_only)
    }

    pub fn get_property_value(&self, owner: &Identity, property: &str) -> Result<PropertyValue> {
        if let Some(tx) = self.active_tx() {
            return tx.get_property_value(self, owner, property);
        }
        let domain = self.domain(owner.domain())?;
        self.calculated.record_read(&PropertyKey::new(owner.clone(), property));
        let record = domain
            .storage()
            .get_element(None, owner)?
            .ok_or_else(|| Error::InvalidReference(owner.to_string()))?;
        let descriptor = record
            .schema
            .property(property)
            .ok_or_else(|| Error::MetadataNotFound(format!("{}.{property}", record.schema.id())))?;
        domain.storage().get_property_value(None, owner, descriptor)
    }

    /// Memoized value of a calculated property of `owner`. A session with
    /// uncommitted writes gets its own memo.
    pub fn calculated_value(
        &self,
        owner: &Identity,
        property: &str,
        compute: impl FnOnce() -> Result<Value>,
    ) -> Result<Value> {
        let scope = self.active_tx().filter(|tx| tx.has_writes()).map(|tx| tx.id());
        self.calculated.evaluate(&PropertyKey::new(owner.clone(), property), scope, compute)
    }
}
