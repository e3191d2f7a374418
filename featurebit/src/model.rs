use crate::error::FeatureStoreError;
use crate::schema::{Field, JoinKey, Schema};
use crate::transform::Transform;
use crate::value::ValueType;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMESTAMP_FIELD: &str = "event_timestamp";

fn invalid(msg: String) -> FeatureStoreError {
    FeatureStoreError::InvalidDefinition(msg)
}

fn check_name(kind: &str, name: &str) -> Result<(), FeatureStoreError> {
    if name.trim().is_empty() {
        return Err(invalid(format!("{} name must not be empty", kind)));
    }
    if name.contains(':') || name.contains("__") {
        return Err(invalid(format!("{} name '{}' must not contain ':' or '__'", kind, name)));
    }
    Ok(())
}

fn check_schema(owner: &str, schema: &Schema) -> Result<(), FeatureStoreError> {
    if let Some(dup) = schema.first_duplicate() {
        return Err(invalid(format!("'{}' declares field '{}' more than once", owner, dup)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub join_keys: Vec<String>,
    pub value_type: Option<ValueType>,
    pub description: String,
}

impl Entity {
    pub fn new(name: impl Into<String>, join_keys: Vec<&str>) -> Self {
        Self { name: name.into(), join_keys: join_keys.into_iter().map(String::from).collect(), value_type: None, description: String::new() }
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Offline table a push source mirrors; only its timestamp columns matter online.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSource {
    pub name: String,
    pub path: String,
    pub timestamp_field: String,
    pub created_timestamp_column: Option<String>,
}

impl FileSource {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self { name: name.into(), path: path.into(), timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(), created_timestamp_column: None }
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    pub fn with_created_timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.created_timestamp_column = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushSource {
    pub name: String,
    pub batch_source: FileSource,
}

impl PushSource {
    pub fn new(name: impl Into<String>, batch_source: FileSource) -> Self {
        Self { name: name.into(), batch_source }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    File(FileSource),
    Push(PushSource),
}

impl DataSource {
    pub fn name(&self) -> &str {
        match self {
            DataSource::File(s) => &s.name,
            DataSource::Push(s) => &s.name,
        }
    }

    pub fn batch_source(&self) -> &FileSource {
        match self {
            DataSource::File(s) => s,
            DataSource::Push(s) => &s.batch_source,
        }
    }
}

impl From<FileSource> for DataSource {
    fn from(s: FileSource) -> Self {
        DataSource::File(s)
    }
}

impl From<PushSource> for DataSource {
    fn from(s: PushSource) -> Self {
        DataSource::Push(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSource {
    pub name: String,
    pub schema: Schema,
}

impl RequestSource {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self { name: name.into(), schema: Schema::new(fields) }
    }
}

/// One online table: rows keyed by the entities' join keys, columns from `schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureView {
    pub name: String,
    pub entities: Vec<Entity>,
    pub schema: Schema,
    pub ttl: Option<Duration>,
    pub online: bool,
    pub source: DataSource,
    pub tags: BTreeMap<String, String>,
}

impl FeatureView {
    pub fn new(
        name: impl Into<String>,
        entities: Vec<Entity>,
        fields: Vec<Field>,
        ttl: Option<Duration>,
        source: impl Into<DataSource>,
    ) -> Result<FeatureView, FeatureStoreError> {
        let view = FeatureView {
            name: name.into(),
            entities,
            schema: Schema::new(fields),
            ttl,
            online: true,
            source: source.into(),
            tags: BTreeMap::new(),
        };
        view.validate()?;
        Ok(view)
    }

    pub fn validate(&self) -> Result<(), FeatureStoreError> {
        check_name("feature view", &self.name)?;
        check_schema(&self.name, &self.schema)
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn join_keys(&self) -> Vec<String> {
        join_keys_of(&self.entities)
    }

    /// Join keys with the dtype their values are normalised to.
    pub fn join_key_specs(&self) -> Vec<JoinKey> {
        join_key_specs_of(&self.entities, &self.schema)
    }

    /// Schema fields that are not join keys.
    pub fn features(&self) -> Vec<&Field> {
        let keys = self.join_keys();
        self.schema.fields().iter().filter(|f| !keys.contains(&f.name)).collect()
    }
}

fn join_keys_of(entities: &[Entity]) -> Vec<String> {
    let mut seen = HashSet::new();
    entities.iter().flat_map(|e| e.join_keys.iter()).filter(|k| seen.insert(k.as_str())).cloned().collect()
}

fn join_key_specs_of(entities: &[Entity], schema: &Schema) -> Vec<JoinKey> {
    join_keys_of(entities)
        .into_iter()
        .map(|name| {
            let dtype = entities
                .iter()
                .find(|e| e.join_keys.contains(&name))
                .and_then(|e| e.value_type)
                .or_else(|| schema.field(&name).map(|f| f.dtype));
            JoinKey { name, dtype }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum OdfvSource {
    FeatureView(FeatureView),
    Request(RequestSource),
}

impl OdfvSource {
    pub fn name(&self) -> &str {
        match self {
            OdfvSource::FeatureView(v) => &v.name,
            OdfvSource::Request(r) => &r.name,
        }
    }
}

/// Where a persisted on demand feature view keeps its outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Persistence {
    pub entities: Vec<Entity>,
    pub feature_view_name: String,
    pub push_source_name: String,
    pub batch_source: FileSource,
}

#[derive(Clone)]
pub struct OnDemandFeatureView {
    pub name: String,
    pub sources: Vec<OdfvSource>,
    pub schema: Schema,
    pub transform: Arc<dyn Transform>,
    pub description: String,
    pub tags: BTreeMap<String, String>,
    pub persistence: Option<Persistence>,
}

impl fmt::Debug for OnDemandFeatureView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDemandFeatureView")
            .field("name", &self.name)
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("schema", &self.schema)
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl OnDemandFeatureView {
    pub fn builder(name: impl Into<String>) -> OdfvBuilder {
        OdfvBuilder {
            name: name.into(),
            sources: Vec::new(),
            fields: Vec::new(),
            transform: None,
            description: String::new(),
            tags: BTreeMap::new(),
            persistence: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn source_views(&self) -> impl Iterator<Item = &FeatureView> {
        self.sources.iter().filter_map(|s| match s {
            OdfvSource::FeatureView(v) => Some(v),
            OdfvSource::Request(_) => None,
        })
    }

    pub fn request_sources(&self) -> impl Iterator<Item = &RequestSource> {
        self.sources.iter().filter_map(|s| match s {
            OdfvSource::Request(r) => Some(r),
            OdfvSource::FeatureView(_) => None,
        })
    }

    /// Persisted views are keyed by their declared entities, transient ones by every source view's keys.
    pub fn join_key_specs(&self) -> Vec<JoinKey> {
        match &self.persistence {
            Some(p) => join_key_specs_of(&p.entities, &self.schema),
            None => {
                let mut seen = HashSet::new();
                self.source_views().flat_map(|v| v.join_key_specs()).filter(|k| seen.insert(k.name.clone())).collect()
            }
        }
    }

    pub fn join_keys(&self) -> Vec<String> {
        self.join_key_specs().into_iter().map(|k| k.name).collect()
    }

    /// Every column the transform may rely on: source view features and request fields.
    pub fn required_inputs(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let view_fields = self.source_views().flat_map(|v| v.features().into_iter().map(|f| f.name.clone()).collect::<Vec<_>>());
        let request_fields = self.request_sources().flat_map(|r| r.schema.names().map(String::from).collect::<Vec<_>>());
        view_fields.chain(request_fields).filter(|n| seen.insert(n.clone())).collect()
    }

    /// The table a persisted view writes its outputs to.
    pub fn backing_feature_view(&self) -> Option<FeatureView> {
        let p = self.persistence.as_ref()?;
        Some(FeatureView {
            name: p.feature_view_name.clone(),
            entities: p.entities.clone(),
            schema: self.schema.clone(),
            ttl: None,
            online: true,
            source: DataSource::Push(PushSource::new(p.push_source_name.clone(), p.batch_source.clone())),
            tags: self.tags.clone(),
        })
    }

    pub fn backing_push_source(&self) -> Option<PushSource> {
        self.persistence.as_ref().map(|p| PushSource::new(p.push_source_name.clone(), p.batch_source.clone()))
    }
}

pub struct OdfvBuilder {
    name: String,
    sources: Vec<OdfvSource>,
    fields: Vec<Field>,
    transform: Option<Arc<dyn Transform>>,
    description: String,
    tags: BTreeMap<String, String>,
    persistence: Option<Persistence>,
}

impl OdfvBuilder {
    pub fn source_view(mut self, view: FeatureView) -> Self {
        self.sources.push(OdfvSource::FeatureView(view));
        self
    }

    pub fn source_request(mut self, request: RequestSource) -> Self {
        self.sources.push(OdfvSource::Request(request));
        self
    }

    pub fn field(mut self, name: impl Into<String>, dtype: ValueType) -> Self {
        self.fields.push(Field::new(name, dtype));
        self
    }

    pub fn transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn persist(mut self, entities: Vec<Entity>, feature_view_name: impl Into<String>, push_source_name: impl Into<String>, batch_source: FileSource) -> Self {
        self.persistence = Some(Persistence {
            entities,
            feature_view_name: feature_view_name.into(),
            push_source_name: push_source_name.into(),
            batch_source,
        });
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<OnDemandFeatureView, FeatureStoreError> {
        check_name("on demand feature view", &self.name)?;
        let schema = Schema::new(self.fields);
        if schema.is_empty() {
            return Err(invalid(format!("on demand feature view '{}' declares no output fields", self.name)));
        }
        check_schema(&self.name, &schema)?;
        if self.sources.is_empty() {
            return Err(invalid(format!("on demand feature view '{}' has no sources", self.name)));
        }
        let mut source_names = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name()) {
                return Err(invalid(format!("on demand feature view '{}' lists source '{}' twice", self.name, source.name())));
            }
        }
        let mut feature_owners: HashMap<&str, &str> = HashMap::new();
        for view in self.sources.iter().filter_map(|s| match s {
            OdfvSource::FeatureView(v) => Some(v),
            OdfvSource::Request(_) => None,
        }) {
            for field in view.features() {
                if let Some(owner) = feature_owners.insert(&field.name, &view.name) {
                    return Err(invalid(format!(
                        "on demand feature view '{}' reads feature '{}' from both '{}' and '{}'",
                        self.name, field.name, owner, view.name
                    )));
                }
            }
        }
        let transform = self.transform.ok_or_else(|| invalid(format!("on demand feature view '{}' has no transform", self.name)))?;
        if let Some(p) = &self.persistence {
            check_name("feature view", &p.feature_view_name)?;
            if p.entities.is_empty() {
                return Err(invalid(format!("persisted on demand feature view '{}' needs at least one entity", self.name)));
            }
            if let Some(missing) = join_keys_of(&p.entities).into_iter().find(|k| !schema.contains(k)) {
                return Err(invalid(format!("persisted on demand feature view '{}' must declare join key '{}' in its schema", self.name, missing)));
            }
        }
        Ok(OnDemandFeatureView {
            name: self.name,
            sources: self.sources,
            schema,
            transform,
            description: self.description,
            tags: self.tags,
            persistence: self.persistence,
        })
    }
}

/// Projection of one view inside a service; `None` selects every feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureViewProjection {
    pub view_name: String,
    pub features: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureService {
    pub name: String,
    pub version: u32,
    pub projections: Vec<FeatureViewProjection>,
    pub description: String,
    pub tags: BTreeMap<String, String>,
}

impl FeatureService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: 1, projections: Vec::new(), description: String::new(), tags: BTreeMap::new() }
    }

    pub fn with_view(mut self, view_name: impl Into<String>) -> Self {
        self.projections.push(FeatureViewProjection { view_name: view_name.into(), features: None });
        self
    }

    pub fn with_projection(mut self, view_name: impl Into<String>, features: Vec<&str>) -> Self {
        self.projections.push(FeatureViewProjection {
            view_name: view_name.into(),
            features: Some(features.into_iter().map(String::from).collect()),
        });
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}
