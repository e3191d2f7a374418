use crate::error::FeatureStoreError;
use crate::model::{DataSource, Entity, FeatureService, FeatureView, OnDemandFeatureView, PushSource};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A definition that can be applied to a registry.
#[derive(Debug, Clone)]
pub enum RegistryObject {
    Entity(Entity),
    FeatureView(FeatureView),
    OnDemandFeatureView(OnDemandFeatureView),
    DataSource(DataSource),
    FeatureService(FeatureService),
}

impl From<Entity> for RegistryObject {
    fn from(v: Entity) -> Self {
        RegistryObject::Entity(v)
    }
}
impl From<FeatureView> for RegistryObject {
    fn from(v: FeatureView) -> Self {
        RegistryObject::FeatureView(v)
    }
}
impl From<OnDemandFeatureView> for RegistryObject {
    fn from(v: OnDemandFeatureView) -> Self {
        RegistryObject::OnDemandFeatureView(v)
    }
}
impl From<PushSource> for RegistryObject {
    fn from(v: PushSource) -> Self {
        RegistryObject::DataSource(DataSource::Push(v))
    }
}
impl From<DataSource> for RegistryObject {
    fn from(v: DataSource) -> Self {
        RegistryObject::DataSource(v)
    }
}
impl From<FeatureService> for RegistryObject {
    fn from(v: FeatureService) -> Self {
        RegistryObject::FeatureService(v)
    }
}

/// Result of a by-name lookup across every kind of definition.
#[derive(Debug, Clone)]
pub enum Resolved {
    Entity(Arc<Entity>),
    FeatureView(Arc<FeatureView>),
    OnDemandFeatureView(Arc<OnDemandFeatureView>),
    DataSource(Arc<DataSource>),
    FeatureService(Arc<FeatureService>),
}

/// Read only view over definitions. Everything returned is immutable for the duration of a request.
pub trait Registry: Send + Sync {
    fn get_entity(&self, name: &str) -> Result<Arc<Entity>, FeatureStoreError>;
    fn get_feature_view(&self, name: &str) -> Result<Arc<FeatureView>, FeatureStoreError>;
    fn get_on_demand_feature_view(&self, name: &str) -> Result<Arc<OnDemandFeatureView>, FeatureStoreError>;
    fn get_data_source(&self, name: &str) -> Result<Arc<DataSource>, FeatureStoreError>;
    fn get_feature_service(&self, name: &str) -> Result<Arc<FeatureService>, FeatureStoreError>;

    fn list_feature_views(&self) -> Vec<Arc<FeatureView>>;
    fn list_on_demand_feature_views(&self) -> Vec<Arc<OnDemandFeatureView>>;

    fn get_push_source(&self, name: &str) -> Result<PushSource, FeatureStoreError> {
        match self.get_data_source(name)?.as_ref() {
            DataSource::Push(push) => Ok(push.clone()),
            DataSource::File(_) => Err(FeatureStoreError::not_found("push source", name)),
        }
    }

    /// Feature views fed by the push source `name`.
    fn feature_views_for_push_source(&self, name: &str) -> Vec<Arc<FeatureView>> {
        self.list_feature_views()
            .into_iter()
            .filter(|v| matches!(&v.source, DataSource::Push(p) if p.name == name))
            .collect()
    }

    /// The persisted on demand view whose outputs live in table `view_name`.
    fn odfv_backed_by(&self, view_name: &str) -> Option<Arc<OnDemandFeatureView>> {
        self.list_on_demand_feature_views()
            .into_iter()
            .find(|o| o.persistence.as_ref().is_some_and(|p| p.feature_view_name == view_name))
    }

    fn resolve(&self, name: &str) -> Result<Resolved, FeatureStoreError> {
        if let Ok(v) = self.get_feature_view(name) {
            return Ok(Resolved::FeatureView(v));
        }
        if let Ok(o) = self.get_on_demand_feature_view(name) {
            return Ok(Resolved::OnDemandFeatureView(o));
        }
        if let Ok(s) = self.get_feature_service(name) {
            return Ok(Resolved::FeatureService(s));
        }
        if let Ok(d) = self.get_data_source(name) {
            return Ok(Resolved::DataSource(d));
        }
        if let Ok(e) = self.get_entity(name) {
            return Ok(Resolved::Entity(e));
        }
        Err(FeatureStoreError::not_found("object", name))
    }
}

/// In memory registry built once and shared read only.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entities: BTreeMap<String, Arc<Entity>>,
    feature_views: BTreeMap<String, Arc<FeatureView>>,
    on_demand_feature_views: BTreeMap<String, Arc<OnDemandFeatureView>>,
    data_sources: BTreeMap<String, Arc<DataSource>>,
    feature_services: BTreeMap<String, Arc<FeatureService>>,
}

impl RegistrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_objects<I, O>(objects: I) -> Result<Self, FeatureStoreError>
    where
        I: IntoIterator<Item = O>,
        O: Into<RegistryObject>,
    {
        let mut registry = RegistrySnapshot::new();
        registry.apply(objects)?;
        Ok(registry)
    }

    /// Registers or replaces definitions. A persisted on demand view also registers its backing
    /// feature view, push source and batch source.
    pub fn apply<I, O>(&mut self, objects: I) -> Result<(), FeatureStoreError>
    where
        I: IntoIterator<Item = O>,
        O: Into<RegistryObject>,
    {
        for object in objects {
            match object.into() {
                RegistryObject::Entity(e) => {
                    self.entities.insert(e.name.clone(), Arc::new(e));
                }
                RegistryObject::FeatureView(v) => self.apply_feature_view(v)?,
                RegistryObject::OnDemandFeatureView(o) => self.apply_odfv(o)?,
                RegistryObject::DataSource(d) => self.apply_data_source(d),
                RegistryObject::FeatureService(s) => {
                    self.feature_services.insert(s.name.clone(), Arc::new(s));
                }
            }
        }
        Ok(())
    }

    fn apply_data_source(&mut self, source: DataSource) {
        if let DataSource::Push(push) = &source {
            let batch = DataSource::File(push.batch_source.clone());
            self.data_sources.insert(batch.name().to_string(), Arc::new(batch));
        }
        self.data_sources.insert(source.name().to_string(), Arc::new(source));
    }

    fn apply_feature_view(&mut self, view: FeatureView) -> Result<(), FeatureStoreError> {
        view.validate()?;
        if self.on_demand_feature_views.contains_key(&view.name) {
            return Err(FeatureStoreError::InvalidDefinition(format!(
                "feature view '{}' clashes with an on demand feature view of the same name",
                view.name
            )));
        }
        for entity in &view.entities {
            self.entities.entry(entity.name.clone()).or_insert_with(|| Arc::new(entity.clone()));
        }
        self.apply_data_source(view.source.clone());
        self.feature_views.insert(view.name.clone(), Arc::new(view));
        Ok(())
    }

    fn apply_odfv(&mut self, odfv: OnDemandFeatureView) -> Result<(), FeatureStoreError> {
        if self.feature_views.contains_key(&odfv.name) {
            return Err(FeatureStoreError::InvalidDefinition(format!(
                "on demand feature view '{}' clashes with a feature view of the same name",
                odfv.name
            )));
        }
        if let Some(backing) = odfv.backing_feature_view() {
            if backing.name == odfv.name {
                return Err(FeatureStoreError::InvalidDefinition(format!(
                    "on demand feature view '{}' cannot persist into a table of its own name",
                    odfv.name
                )));
            }
            self.apply_feature_view(backing)?;
        }
        self.on_demand_feature_views.insert(odfv.name.clone(), Arc::new(odfv));
        Ok(())
    }
}

fn lookup<T>(map: &BTreeMap<String, Arc<T>>, kind: &'static str, name: &str) -> Result<Arc<T>, FeatureStoreError> {
    map.get(name).cloned().ok_or_else(|| FeatureStoreError::not_found(kind, name))
}

impl Registry for RegistrySnapshot {
    fn get_entity(&self, name: &str) -> Result<Arc<Entity>, FeatureStoreError> {
        lookup(&self.entities, "entity", name)
    }

    fn get_feature_view(&self, name: &str) -> Result<Arc<FeatureView>, FeatureStoreError> {
        lookup(&self.feature_views, "feature view", name)
    }

    fn get_on_demand_feature_view(&self, name: &str) -> Result<Arc<OnDemandFeatureView>, FeatureStoreError> {
        lookup(&self.on_demand_feature_views, "on demand feature view", name)
    }

    fn get_data_source(&self, name: &str) -> Result<Arc<DataSource>, FeatureStoreError> {
        lookup(&self.data_sources, "data source", name)
    }

    fn get_feature_service(&self, name: &str) -> Result<Arc<FeatureService>, FeatureStoreError> {
        lookup(&self.feature_services, "feature service", name)
    }

    fn list_feature_views(&self) -> Vec<Arc<FeatureView>> {
        self.feature_views.values().cloned().collect()
    }

    fn list_on_demand_feature_views(&self) -> Vec<Arc<OnDemandFeatureView>> {
        self.on_demand_feature_views.values().cloned().collect()
    }
}
