//! `DefaultServer`: the full-featured server facade.
//!
//! Owns the service table, method registry, middleware, store and route
//! table, drives the lifecycle, and answers both listeners by resolving
//! each call and handing it to the dispatch pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW,
};
use meridian_protocol::{HandlerResult, MetadataMap, ServiceError, split_target};
use meridian_trace::{TraceContext, Tracer};
use meridian_transport::{
    HttpHandler, HttpRequest, HttpResponse, HttpVerb, RpcHandler, ShutdownHandle, TransportServer,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::capability::{
    Decodable, Encodeable, HttpInterceptor, Middlewareable, Optionable, Server,
};
use crate::config::ServerConfig;
use crate::context::{RequestContext, Transport};
use crate::error::ServerError;
use crate::initializer::Initializer;
use crate::middleware::{Middleware, MiddlewareSet};
use crate::pipeline::{self, Dispatch};
use crate::registry::{Decoder, Encoder, HttpHandlerFn, MethodEntry, MethodRegistry};
use crate::router::{HttpRouter, RouteMatch};
use crate::service::{ErasedFactory, MethodCall, ServiceInstance, ServiceRegistration};
use crate::store::{Store, StoreValue};

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct ServiceSlot {
    factory: Arc<dyn ErasedFactory>,
    calls: HashMap<String, MethodCall>,
    instance: Option<ServiceInstance>,
}

struct Inner {
    config: ServerConfig,
    tracer: Option<Arc<Tracer>>,
    registry: RwLock<MethodRegistry>,
    services: RwLock<BTreeMap<String, ServiceSlot>>,
    middlewares: RwLock<MiddlewareSet>,
    initializers: RwLock<Vec<Arc<dyn Initializer>>>,
    store: Store,
    router: RwLock<Arc<HttpRouter>>,
    state: watch::Sender<ServerState>,
    /// Terminal error handed to `wait`.
    failure: Mutex<Option<ServerError>>,
    abandon: watch::Sender<bool>,
    transport: Mutex<Option<ShutdownHandle>>,
    aborts: Mutex<Vec<AbortHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    drained: Notify,
    ports: Mutex<(Option<u16>, Option<u16>)>,
}

/// The server facade. Cloning yields another handle on the same server.
#[derive(Clone)]
pub struct DefaultServer {
    inner: Arc<Inner>,
}

impl DefaultServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    /// A server whose calls open spans on `tracer`.
    pub fn with_tracer(config: ServerConfig, tracer: Arc<Tracer>) -> Self {
        Self::build(config, Some(tracer))
    }

    fn build(config: ServerConfig, tracer: Option<Arc<Tracer>>) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        let (abandon, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                tracer,
                registry: RwLock::new(MethodRegistry::new()),
                services: RwLock::new(BTreeMap::new()),
                middlewares: RwLock::new(MiddlewareSet::new()),
                initializers: RwLock::new(Vec::new()),
                store: Store::new(),
                router: RwLock::new(Arc::new(HttpRouter::default())),
                state,
                failure: Mutex::new(None),
                abandon,
                transport: Mutex::new(None),
                aborts: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                ports: Mutex::new((None, None)),
            }),
        }
    }

    /// Make `middleware` available to methods under `name`.
    pub fn register_middleware<M: Middleware>(&self, name: impl Into<String>, middleware: M) {
        let name = name.into();
        debug!("Registering middleware: {name}");
        self.inner.middlewares.write().insert(name, middleware);
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    pub fn tracer(&self) -> Option<&Arc<Tracer>> {
        self.inner.tracer.as_ref()
    }

    /// Handle on the server-scoped store.
    pub fn store_handle(&self) -> Store {
        self.inner.store.clone()
    }

    /// Bound REST port once started.
    pub fn http_port(&self) -> Option<u16> {
        self.inner.ports.lock().0
    }

    /// Bound native RPC port once started.
    pub fn rpc_port(&self) -> Option<u16> {
        self.inner.ports.lock().1
    }

    pub fn route_count(&self) -> usize {
        self.inner.router.read().len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Run initializers, instantiate services, build routes and bind the
    /// listeners. Returns once serving has begun.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut began = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ServerState::Created {
                *state = ServerState::Starting;
                began = true;
            }
            began
        });
        if !began {
            return Err(ServerError::AlreadyStarted);
        }

        info!("Starting {}", self.inner.config.service_name);
        let transport = match self.boot().await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Server failed to start: {e}");
                self.record_failure(e.clone());
                self.finish();
                return Err(e);
            }
        };

        *self.inner.ports.lock() = (transport.http_port(), transport.rpc_port());
        *self.inner.transport.lock() = Some(transport.shutdown_handle());
        *self.inner.aborts.lock() = transport.abort_handles();
        self.inner.state.send_replace(ServerState::Running);

        let server = self.clone();
        let monitor = tokio::spawn(async move {
            if let Err(e) = transport.join().await {
                server.record_failure(e.into());
                if server.state() == ServerState::Running {
                    server.finish();
                }
            }
        });
        *self.inner.monitor.lock() = Some(monitor);

        info!(
            "{} running ({} services, {} routes)",
            self.inner.config.service_name,
            self.inner.services.read().len(),
            self.route_count()
        );
        Ok(())
    }

    async fn boot(&self) -> Result<TransportServer, ServerError> {
        let initializers = self.inner.initializers.read().clone();
        for initializer in &initializers {
            initializer.pre_init();
        }
        for (index, initializer) in initializers.iter().enumerate() {
            initializer
                .init(self)
                .map_err(|e| ServerError::Initializer {
                    index,
                    message: e.to_string(),
                })?;
        }
        for initializer in &initializers {
            initializer.post_init();
        }

        self.instantiate(false);
        self.check_middlewares()?;
        self.rebuild_routes()?;

        let transport =
            TransportServer::start(self.inner.config.transport_config(), Arc::new(self.clone()))
                .await?;
        Ok(transport)
    }

    /// Drain in-flight calls for at most `timeout`, then abandon whatever
    /// is left. Returns once the server is stopped.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ServerError> {
        let mut previous = ServerState::Stopped;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ServerState::Running => *state = ServerState::Stopping,
                ServerState::Created => *state = ServerState::Stopped,
                _ => return false,
            }
            true
        });
        match previous {
            ServerState::Running => {}
            ServerState::Created | ServerState::Stopped => return Ok(()),
            ServerState::Starting => return Err(ServerError::NotRunning),
            ServerState::Stopping => {
                let _ = self.wait().await;
                return Ok(());
            }
        }

        info!("Stopping server (timeout {timeout:?})");
        let handle = self.inner.transport.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        let monitor = self.inner.monitor.lock().take();
        let graceful = tokio::time::timeout(timeout, async {
            self.drained().await;
            if let Some(monitor) = monitor {
                let _ = monitor.await;
            }
        })
        .await
        .is_ok();

        if !graceful {
            warn!(
                "Shutdown timeout reached with {} calls in flight; abandoning them",
                self.inner.in_flight.load(Ordering::SeqCst)
            );
            self.inner.abandon.send_replace(true);
            for handle in self.inner.aborts.lock().drain(..) {
                handle.abort();
            }
        }
        self.finish();
        Ok(())
    }

    /// Resolve once the server is stopped, with the terminal error if any.
    pub async fn wait(&self) -> Result<(), ServerError> {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
        match self.inner.failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every initializer's `reinit`, then recreate service instances and
    /// rebuild the route table. A failure leaves the server running.
    pub fn reinit(&self) -> Result<(), ServerError> {
        if self.state() != ServerState::Running {
            return Err(ServerError::NotRunning);
        }
        info!("Reinitializing server");
        let initializers = self.inner.initializers.read().clone();
        for (index, initializer) in initializers.iter().enumerate() {
            if let Err(e) = initializer.reinit(self) {
                let err = ServerError::Initializer {
                    index,
                    message: e.to_string(),
                };
                error!("Reinit failed: {err}");
                return Err(err);
            }
        }
        for (factory, old) in self.instantiate(true) {
            factory.dispose(old);
        }
        self.rebuild_routes()?;
        info!("Server reinitialized ({} routes)", self.route_count());
        Ok(())
    }

    fn record_failure(&self, err: ServerError) {
        self.inner.failure.lock().get_or_insert(err);
    }

    fn finish(&self) {
        let disposed: Vec<_> = self
            .inner
            .services
            .write()
            .values_mut()
            .filter_map(|slot| Some((slot.factory.clone(), slot.instance.take()?)))
            .collect();
        for (factory, instance) in disposed {
            factory.dispose(instance);
        }
        self.inner.state.send_replace(ServerState::Stopped);
        info!("Server stopped");
    }

    async fn drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Create instances for every service (or only those without one).
    /// Returns the instances that were replaced.
    fn instantiate(&self, refresh: bool) -> Vec<(Arc<dyn ErasedFactory>, ServiceInstance)> {
        let pending: Vec<(String, Arc<dyn ErasedFactory>)> = self
            .inner
            .services
            .read()
            .iter()
            .filter(|(_, slot)| refresh || slot.instance.is_none())
            .map(|(name, slot)| (name.clone(), slot.factory.clone()))
            .collect();

        let mut replaced = Vec::new();
        for (name, factory) in pending {
            let instance = factory.create(self);
            debug!("Created instance of {name}");
            if let Some(slot) = self.inner.services.write().get_mut(&name) {
                if let Some(old) = slot.instance.replace(instance) {
                    replaced.push((factory, old));
                }
            }
        }
        replaced
    }

    fn check_middlewares(&self) -> Result<(), ServerError> {
        let registry = self.inner.registry.read();
        let set = self.inner.middlewares.read();
        for name in &self.inner.config.default_middlewares {
            if !set.contains(name) {
                return Err(ServerError::UnknownMiddleware {
                    name: name.clone(),
                    service: "*".into(),
                    method: "*".into(),
                });
            }
        }
        for (service, method) in registry.methods() {
            let Some(entry) = registry.get(&service, &method) else {
                continue;
            };
            if let Some(name) = entry.middlewares.iter().find(|n| !set.contains(n)) {
                return Err(ServerError::UnknownMiddleware {
                    name: name.clone(),
                    service,
                    method,
                });
            }
        }
        Ok(())
    }

    fn rebuild_routes(&self) -> Result<(), ServerError> {
        let router = HttpRouter::build(self.inner.registry.read().routes())?;
        debug!("Route table built with {} routes", router.len());
        *self.inner.router.write() = Arc::new(router);
        Ok(())
    }

    /// Apply a registry change; a running server re-routes immediately.
    fn update_registry(&self, change: impl FnOnce(&mut MethodRegistry)) {
        change(&mut self.inner.registry.write());
        if self.state() == ServerState::Running {
            if let Err(e) = self.rebuild_routes() {
                warn!("Keeping previous route table: {e}");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    fn enter(&self) -> InFlight<'_> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.inner)
    }

    fn admit(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServerState::Running => Ok(()),
            ServerState::Stopping | ServerState::Stopped => Err(ServiceError::shutting_down()),
            ServerState::Created | ServerState::Starting => Err(ServiceError::not_initialized()),
        }
    }

    fn dispatch_for(&self, service: &str, method: &str) -> Option<Dispatch> {
        let handler = self.inner.services.read().get(service).and_then(|slot| {
            let call = slot.calls.get(method)?.clone();
            Some((call, slot.instance.clone()?))
        });

        let registry = self.inner.registry.read();
        let entry = registry.get(service, method);
        if handler.is_none() && entry.is_none() {
            return None;
        }
        let entry: Arc<MethodEntry> = entry.unwrap_or_default();
        let names = self
            .inner
            .config
            .default_middlewares
            .iter()
            .chain(entry.middlewares.iter())
            .map(String::as_str);
        let chain = self.inner.middlewares.read().chain(names);

        Some(Dispatch {
            default_encoder: registry.default_encoder(service),
            default_decoder: registry.default_decoder(service),
            entry,
            handler,
            chain,
            abandon: self.inner.abandon.subscribe(),
        })
    }

    fn context(
        &self,
        service: &str,
        method: &str,
        transport: Transport,
        metadata: MetadataMap,
        entry: &MethodEntry,
    ) -> RequestContext {
        let mut ctx = RequestContext::new(service, method, transport)
            .with_options(entry.options.clone())
            .with_store(self.inner.store.clone());
        if let Some(tracer) = &self.inner.tracer {
            ctx = ctx.with_trace_context(TraceContext::new(tracer.clone()));
        }
        ctx.with_metadata(metadata)
    }
}

impl std::fmt::Debug for DefaultServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultServer")
            .field("service_name", &self.inner.config.service_name)
            .field("state", &self.state())
            .finish()
    }
}

struct InFlight<'a>(&'a Inner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// 204 answer to an `OPTIONS` preflight on a binding without a handler.
fn preflight(allowed: &[HttpVerb]) -> HttpResponse {
    let verbs = allowed
        .iter()
        .map(HttpVerb::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    HttpResponse::no_content()
        .with_header(ALLOW, &verbs)
        .with_header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .with_header(ACCESS_CONTROL_ALLOW_METHODS, &verbs)
        .with_header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
}

impl RpcHandler for DefaultServer {
    async fn handle_rpc(
        &self,
        method: &str,
        metadata: MetadataMap,
        params: Option<Value>,
    ) -> HandlerResult {
        let _guard = self.enter();
        self.admit()?;

        let Some((service, name)) = split_target(method) else {
            return Err(ServiceError::method_not_found(method));
        };
        let Some(dispatch) = self.dispatch_for(service, name) else {
            return Err(ServiceError::method_not_found(method));
        };
        if dispatch.handler.is_none() {
            return Err(ServiceError::method_not_found(method));
        }

        let ctx = self.context(service, name, Transport::Rpc, metadata, &dispatch.entry);
        pipeline::run_rpc(dispatch, ctx, params).await
    }
}

impl HttpHandler for DefaultServer {
    async fn handle_http(&self, mut request: HttpRequest) -> HttpResponse {
        let _guard = self.enter();
        if let Err(e) = self.admit() {
            return HttpResponse::error(&e);
        }

        let verb = request.verb();
        let router = self.inner.router.read().clone();
        let (service, method, params, allowed) = match router.resolve(verb, &request.path) {
            RouteMatch::Found {
                service,
                method,
                params,
                allowed,
            } => (service, method, params, allowed),
            RouteMatch::NotFound => {
                debug!("No route for {} {}", request.method, request.path);
                return HttpResponse::error(&ServiceError::route_not_found(
                    request.method.as_str(),
                    &request.path,
                ));
            }
        };

        let Some(dispatch) = self.dispatch_for(&service, &method) else {
            return HttpResponse::error(&ServiceError::method_not_found(&format!(
                "{service}/{method}"
            )));
        };
        if verb == Some(HttpVerb::Options) && dispatch.entry.http_handler.is_none() {
            return preflight(&allowed);
        }

        let metadata = MetadataMap::from_headers(&request.headers);
        let ctx = self
            .context(&service, &method, Transport::Http, metadata, &dispatch.entry)
            .with_params(params.clone());
        request.params = params;
        pipeline::run_http(dispatch, ctx, request).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server contract and capabilities
// ─────────────────────────────────────────────────────────────────────────────

impl Server for DefaultServer {
    fn register_service(&self, registration: ServiceRegistration) -> Result<(), ServerError> {
        registration.validate()?;
        let name = registration.name.clone();
        let method_count = registration.methods.len();
        {
            let mut services = self.inner.services.write();
            if services.contains_key(&name) {
                return Err(ServerError::DuplicateService(name));
            }
            let calls = registration
                .methods
                .into_iter()
                .map(|m| (m.name, m.call))
                .collect();
            services.insert(
                name.clone(),
                ServiceSlot {
                    factory: registration.factory,
                    calls,
                    instance: None,
                },
            );
        }
        info!("Registered service {name} ({method_count} methods)");
        if self.state() == ServerState::Running {
            self.instantiate(false);
        }
        Ok(())
    }

    fn add_initializers(&self, initializers: Vec<Arc<dyn Initializer>>) {
        self.inner.initializers.write().extend(initializers);
    }

    fn store(&self, key: &str, value: StoreValue) {
        self.inner.store.put(key, value);
    }

    fn fetch(&self, key: &str) -> Option<StoreValue> {
        self.inner.store.get(key)
    }

    fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn as_encodeable(&self) -> Option<&dyn Encodeable> {
        Some(self)
    }

    fn as_decodable(&self) -> Option<&dyn Decodable> {
        Some(self)
    }

    fn as_http_interceptor(&self) -> Option<&dyn HttpInterceptor> {
        Some(self)
    }

    fn as_optionable(&self) -> Option<&dyn Optionable> {
        Some(self)
    }

    fn as_middlewareable(&self) -> Option<&dyn Middlewareable> {
        Some(self)
    }
}

impl Encodeable for DefaultServer {
    fn add_encoder(
        &self,
        service: &str,
        method: &str,
        verbs: &[HttpVerb],
        path: &str,
        encoder: Option<Encoder>,
    ) {
        self.update_registry(|r| r.add_encoder(service, method, verbs, path, encoder));
    }

    fn add_default_encoder(&self, service: &str, encoder: Encoder) {
        self.update_registry(|r| r.set_default_encoder(service, encoder));
    }
}

impl Decodable for DefaultServer {
    fn add_decoder(&self, service: &str, method: &str, decoder: Decoder) {
        self.update_registry(|r| r.add_decoder(service, method, decoder));
    }

    fn add_default_decoder(&self, service: &str, decoder: Decoder) {
        self.update_registry(|r| r.set_default_decoder(service, decoder));
    }
}

impl HttpInterceptor for DefaultServer {
    fn add_http_handler(&self, service: &str, method: &str, path: &str, handler: HttpHandlerFn) {
        self.update_registry(|r| r.add_http_handler(service, method, path, handler));
    }
}

impl Optionable for DefaultServer {
    fn add_option(&self, service: &str, method: &str, option: &str) {
        self.update_registry(|r| r.add_option(service, method, option));
    }
}

impl Middlewareable for DefaultServer {
    fn add_middleware(&self, service: &str, method: &str, names: &[&str]) {
        self.update_registry(|r| r.add_middleware(service, method, names));
    }
}
