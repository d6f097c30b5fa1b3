//! Service descriptors, factories and the type-erased registration that
//! binds them to a server.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use meridian_protocol::{HandlerResult, ServiceError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::capability::Server;
use crate::context::RequestContext;
use crate::error::ServerError;

/// Boxed future returned by an erased method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A live service instance with its concrete type erased.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

pub(crate) type MethodCall =
    Arc<dyn Fn(ServiceInstance, RequestContext, Value) -> MethodFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MethodDesc {
    pub(crate) name: String,
    pub(crate) call: MethodCall,
}

/// The method table of one service, as a generated binding would emit it.
pub struct ServiceDescriptor<S> {
    name: String,
    methods: Vec<MethodDesc>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> ServiceDescriptor<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            _service: PhantomData,
        }
    }

    /// Add a method. The request is deserialized from the call's JSON value
    /// (`InvalidParams` on mismatch) and the response serialized back.
    pub fn method<Req, Resp, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Arc<S>, RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ServiceError>> + Send + 'static,
    {
        let call: MethodCall = Arc::new(
            move |instance: ServiceInstance, ctx: RequestContext, params: Value| -> MethodFuture {
                let Ok(service) = instance.downcast::<S>() else {
                    return Box::pin(async {
                        Err(ServiceError::internal("service instance has the wrong type"))
                    });
                };
                let request = match serde_json::from_value::<Req>(params) {
                    Ok(request) => request,
                    Err(e) => return Box::pin(async move { Err(ServiceError::from(e)) }),
                };
                let response = handler(service, ctx, request);
                Box::pin(async move {
                    let response = response.await?;
                    serde_json::to_value(response).map_err(|e| {
                        ServiceError::internal(format!("failed to serialize response: {e}"))
                    })
                })
            },
        );
        self.methods.push(MethodDesc {
            name: name.into(),
            call,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.iter().map(|m| m.name.as_str()).collect()
    }
}

/// Creates and disposes service instances.
///
/// Instances are created when the server starts, recreated on reinit, and
/// disposed on stop and before recreation.
pub trait ServiceFactory<S>: Send + Sync + 'static {
    fn new_service(&self, server: &dyn Server) -> S;

    fn dispose_service(&self, _service: Arc<S>) {}
}

impl<S, F> ServiceFactory<S> for F
where
    F: Fn(&dyn Server) -> S + Send + Sync + 'static,
{
    fn new_service(&self, server: &dyn Server) -> S {
        self(server)
    }
}

pub(crate) trait ErasedFactory: Send + Sync {
    fn create(&self, server: &dyn Server) -> ServiceInstance;
    fn dispose(&self, instance: ServiceInstance);
}

struct TypedFactory<S, F> {
    factory: F,
    _service: PhantomData<fn() -> S>,
}

impl<S, F> ErasedFactory for TypedFactory<S, F>
where
    S: Send + Sync + 'static,
    F: ServiceFactory<S>,
{
    fn create(&self, server: &dyn Server) -> ServiceInstance {
        Arc::new(self.factory.new_service(server))
    }

    fn dispose(&self, instance: ServiceInstance) {
        if let Ok(service) = instance.downcast::<S>() {
            self.factory.dispose_service(service);
        }
    }
}

/// A descriptor paired with its factory, ready for
/// [`Server::register_service`].
pub struct ServiceRegistration {
    pub(crate) name: String,
    pub(crate) methods: Vec<MethodDesc>,
    pub(crate) factory: Arc<dyn ErasedFactory>,
}

impl ServiceRegistration {
    pub fn new<S, F>(descriptor: ServiceDescriptor<S>, factory: F) -> Self
    where
        S: Send + Sync + 'static,
        F: ServiceFactory<S>,
    {
        Self {
            name: descriptor.name,
            methods: descriptor.methods,
            factory: Arc::new(TypedFactory {
                factory,
                _service: PhantomData,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validate(&self) -> Result<(), ServerError> {
        let invalid = |reason: &str| ServerError::InvalidDescriptor {
            service: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("empty service name"));
        }
        if self.name.contains('/') {
            return Err(invalid("service name contains '/'"));
        }
        if self.methods.is_empty() {
            return Err(invalid("no methods"));
        }
        let mut seen = HashSet::new();
        for method in &self.methods {
            if method.name.is_empty() || method.name.contains('/') {
                return Err(invalid("empty or malformed method name"));
            }
            if !seen.insert(method.name.as_str()) {
                return Err(ServerError::InvalidDescriptor {
                    service: self.name.clone(),
                    reason: format!("duplicate method {}", method.name),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("name", &self.name)
            .field(
                "methods",
                &self.methods.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
