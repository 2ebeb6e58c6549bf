//! Registries mapping workflow types and activity names to handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{ActivityHandler, FnActivity, FnWorkflow, WorkflowHandler};
use crate::{ActivityContext, WorkflowContext};

/// Immutable name → handler map shared by all workers.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub type WorkflowRegistry = Registry<dyn WorkflowHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type WorkflowRegistryBuilder = RegistryBuilder<dyn WorkflowHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

/// Builder collecting handlers; duplicate names are registration errors.
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        if !self.errors.is_empty() {
            panic!("registry build errors: {}", self.errors.join("; "));
        }
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Non-panicking variant.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(Registry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }

    /// Merge another registry into this builder.
    pub fn merge(mut self, other: Registry<H>, label: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate {label} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), handler.clone());
            }
        }
        self
    }

    fn insert(&mut self, name: String, handler: Arc<H>, label: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {label} registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
    }
}

impl WorkflowRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnWorkflow(f)), "workflow");
        self
    }

    /// Typed registration: input deserialized from JSON, output serialized.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: WorkflowContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::codec::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::codec::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnWorkflow(wrapper)), "workflow");
        self
    }

    pub fn merge_workflows(self, other: WorkflowRegistry) -> Self {
        self.merge(other, "workflow")
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::codec::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::codec::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    pub fn merge_activities(self, other: ActivityRegistry) -> Self {
        self.merge(other, "activity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_an_error() {
        let result = ActivityRegistry::builder()
            .register("A", |_ctx, input: String| async move { Ok(input) })
            .register("A", |_ctx, input: String| async move { Ok(input) })
            .build_result();
        assert!(result.unwrap_err().contains("duplicate activity registration: A"));
    }

    #[tokio::test]
    async fn typed_registration_round_trips() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Req {
            n: u32,
        }
        let reg = ActivityRegistry::builder()
            .register_typed("Double", |_ctx: ActivityContext, req: Req| async move { Ok(req.n * 2) })
            .build();
        let handler = reg.get("Double").unwrap();
        let ctx = ActivityContext::new(
            "w".into(),
            1,
            "Double".into(),
            1,
            "test".into(),
            tokio_util::sync::CancellationToken::new(),
        );
        let out = handler.invoke(ctx, r#"{"n": 21}"#.to_string()).await.unwrap();
        assert_eq!(out, "42");
    }
}
