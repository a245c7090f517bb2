//! The process-scoped facade an instrumentation host talks to.

use crate::{
    abi::{
        intercept::{HookId, Interceptor, Interposer, SwiftHook},
        invoke::{CallBackend, Invoker, NativeBackend},
        Abi, CallSignature,
    },
    error::{BridgeError, Result},
    image::{ModuleImage, ModuleSource, StaticModuleSource},
    memory::{LocalMemory, Memory},
    resolve::{Catalog, MetadataAccessor, SwiftModule},
    runtime::{BoxAllocator, Demangler, HeapBoxAllocator, SwiftRuntime},
    symbols::{is_swift_symbol, parse_signature, MethodSignature, SignatureKind},
    types::{
        protocols::{ProtocolComposition, ProtocolDescriptor},
        TypeDescriptor, TypeKind,
    },
    value::{existential, Value},
};
use dashmap::DashMap;
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tracing::{debug, warn};

/// Types are keyed by identity; the cached signature keeps them alive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SignatureKey {
    address: usize,
    result: Option<usize>,
    arguments: Vec<usize>,
    has_context: bool,
    throws: bool,
}

/// Configures a [`Bridge`].
pub struct BridgeBuilder {
    memory: Arc<dyn Memory>,
    source: Arc<dyn ModuleSource>,
    backend: Arc<dyn CallBackend>,
    interposer: Option<Arc<dyn Interposer>>,
    allocator: Option<Arc<dyn BoxAllocator>>,
    demangler: Option<Arc<dyn Demangler>>,
    runtime: Option<Arc<SwiftRuntime>>,
    abi: Abi,
    access_metadata: bool,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self {
            memory: Arc::new(LocalMemory),
            source: Arc::new(StaticModuleSource::default()),
            backend: Arc::new(NativeBackend),
            interposer: None,
            allocator: None,
            demangler: None,
            runtime: None,
            abi: Abi::host(),
            access_metadata: false,
        }
    }
}

impl BridgeBuilder {
    pub fn memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn source(mut self, source: Arc<dyn ModuleSource>) -> Self {
        self.source = source;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn CallBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn interposer(mut self, interposer: Arc<dyn Interposer>) -> Self {
        self.interposer = Some(interposer);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn BoxAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn demangler(mut self, demangler: Arc<dyn Demangler>) -> Self {
        self.demangler = Some(demangler);
        self
    }

    /// Uses the runtime for demangling and boxing unless those are set
    /// explicitly.
    pub fn runtime(mut self, runtime: SwiftRuntime) -> Self {
        self.runtime = Some(Arc::new(runtime));
        self
    }

    pub fn abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    /// Calls type metadata access functions through the call backend while
    /// resolving types.
    pub fn access_metadata(mut self, enabled: bool) -> Self {
        self.access_metadata = enabled;
        self
    }

    pub fn build(self) -> Result<Bridge> {
        let invoker = Arc::new(Invoker::new(self.memory.clone(), self.backend.clone()));
        let accessor = self
            .access_metadata
            .then(|| invoker.clone() as Arc<dyn MetadataAccessor>);
        let catalog = Arc::new(Catalog::new(self.memory, self.source.as_ref(), accessor)?);

        let allocator: Arc<dyn BoxAllocator> = match (self.allocator, &self.runtime) {
            (Some(allocator), _) => allocator,
            (None, Some(runtime)) => match runtime.box_allocator(self.backend.clone()) {
                Some(allocator) => Arc::new(allocator),
                None => Arc::new(HeapBoxAllocator),
            },
            (None, None) => Arc::new(HeapBoxAllocator),
        };
        let demangler = self
            .demangler
            .or_else(|| self.runtime.clone().map(|r| r as Arc<dyn Demangler>));

        Ok(Bridge {
            catalog,
            source: self.source,
            invoker,
            interceptor: self.interposer.map(Interceptor::new),
            allocator,
            demangler,
            _runtime: self.runtime,
            abi: self.abi,
            signatures: DashMap::new(),
        })
    }
}

pub struct Bridge {
    catalog: Arc<Catalog>,
    source: Arc<dyn ModuleSource>,
    invoker: Arc<Invoker>,
    interceptor: Option<Interceptor>,
    allocator: Arc<dyn BoxAllocator>,
    demangler: Option<Arc<dyn Demangler>>,
    _runtime: Option<Arc<SwiftRuntime>>,
    abi: Abi,
    signatures: DashMap<SignatureKey, Arc<CallSignature>>,
}

impl Debug for Bridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("abi", &self.abi.name)
            .field("images", &self.catalog.images().len())
            .field("signatures", &self.signatures.len())
            .finish()
    }
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        self.catalog.memory()
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn modules(&self) -> Vec<SwiftModule> {
        self.catalog.list_modules()
    }

    pub fn classes(&self) -> Registry<'_> {
        Registry::new(&self.catalog, TypeKind::Class)
    }

    pub fn structs(&self) -> Registry<'_> {
        Registry::new(&self.catalog, TypeKind::Struct)
    }

    pub fn enums(&self) -> Registry<'_> {
        Registry::new(&self.catalog, TypeKind::Enum)
    }

    /// Protocols resolve to their existential types.
    pub fn protocols(&self) -> Registry<'_> {
        Registry::new(&self.catalog, TypeKind::Protocol)
    }

    pub fn protocol(&self, full_name: &str) -> Result<Arc<ProtocolDescriptor>> {
        self.catalog.resolve_protocol(full_name)
    }

    /// Resolves a source-level type name such as `[Swift.Int]` or `main.P & main.Q`.
    pub fn type_named(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.catalog.resolve_type_name(name)
    }

    /// Places a signature for the bridge's ABI, cached per target.
    pub fn signature(
        &self,
        address: usize,
        result: Option<Arc<TypeDescriptor>>,
        arguments: Vec<Arc<TypeDescriptor>>,
        has_context: bool,
        throws: bool,
    ) -> Result<Arc<CallSignature>> {
        let key = SignatureKey {
            address,
            result: result.as_ref().map(|t| Arc::as_ptr(t) as usize),
            arguments: arguments.iter().map(|t| Arc::as_ptr(t) as usize).collect(),
            has_context,
            throws,
        };
        if let Some(signature) = self.signatures.get(&key) {
            return Ok(signature.clone());
        }
        let signature = Arc::new(CallSignature::new(self.abi, result, arguments, has_context, throws)?);
        Ok(self.signatures.entry(key).or_insert(signature).clone())
    }

    pub fn native_function(
        &self,
        address: usize,
        result: Option<Arc<TypeDescriptor>>,
        arguments: Vec<Arc<TypeDescriptor>>,
        has_context: bool,
        throws: bool,
    ) -> Result<NativeFunction> {
        if address == 0 {
            return Err(BridgeError::InvalidValue("null function pointer".into()));
        }
        Ok(NativeFunction {
            address,
            signature: self.signature(address, result, arguments, has_context, throws)?,
            context: None,
            invoker: self.invoker.clone(),
        })
    }

    fn demangle(&self, symbol: &str) -> Option<String> {
        if !is_swift_symbol(symbol) {
            return Some(symbol.to_string());
        }
        self.demangler.as_ref()?.demangle(symbol)
    }

    /// The demangled signature of the function at `address`.
    pub fn method_signature(&self, address: usize) -> Result<MethodSignature> {
        let symbol = self
            .catalog
            .symbol_at(address)
            .ok_or_else(|| BridgeError::not_found(format!("symbol at {address:#x}")))?;
        let demangled = self
            .demangle(&symbol)
            .ok_or_else(|| BridgeError::Runtime(format!("cannot demangle {symbol}")))?;
        parse_signature(&demangled).ok_or_else(|| {
            BridgeError::UnsupportedSignature(format!("cannot parse {demangled}"))
        })
    }

    fn place(&self, address: usize, method: &MethodSignature) -> Result<Arc<CallSignature>> {
        let arguments = method
            .argument_types()
            .into_iter()
            .map(|ty| self.catalog.resolve_type_name(ty))
            .collect::<Result<Vec<_>>>()?;
        let result = method
            .result
            .as_deref()
            .map(|ty| self.catalog.resolve_type_name(ty))
            .transpose()?;
        self.signature(address, result, arguments, method.has_context(), method.throws)
    }

    /// The placed signature of the function at `address`, derived from its symbol.
    pub fn symbol_signature(&self, address: usize) -> Result<Arc<CallSignature>> {
        let method = self.method_signature(address)?;
        self.place(address, &method)
    }

    /// The allocating initializer of `class` whose argument labels are
    /// `labels`, bound to the class metadata.
    pub fn initializer(&self, class: &TypeDescriptor, labels: &[&str]) -> Result<NativeFunction> {
        if !class.is_class() {
            return Err(BridgeError::InvalidValue(format!("{} is not a class", class.full_name())));
        }
        for entry in self.catalog.methods_of(class).into_iter().filter(|m| m.is_initializer()) {
            let Ok(method) = self.method_signature(entry.address) else {
                continue;
            };
            let matches = method.kind == SignatureKind::Initializer || method.name.ends_with("init");
            let method_labels: Vec<_> = method
                .parameters
                .iter()
                .map(|p| p.label.as_deref().unwrap_or("_"))
                .collect();
            if !matches || method_labels != labels {
                continue;
            }
            let signature = self.place(entry.address, &method)?;
            debug!(class = %class.full_name(), init = %method, "found initializer");
            return Ok(NativeFunction {
                address: entry.address,
                signature,
                context: Some(self.catalog.metadata_of(class)?),
                invoker: self.invoker.clone(),
            });
        }
        Err(BridgeError::not_found(format!(
            "{}.init({})",
            class.full_name(),
            labels.iter().map(|l| format!("{l}:")).collect::<String>()
        )))
    }

    pub fn wrap(&self, value: &Value, composition: &ProtocolComposition) -> Result<Value> {
        existential::wrap(&self.catalog, self.allocator.as_ref(), value, composition)
    }

    pub fn unwrap(&self, container: &Value) -> Result<(Arc<TypeDescriptor>, Value)> {
        existential::unwrap(&self.catalog, container)
    }

    fn interceptor(&self) -> Result<&Interceptor> {
        self.interceptor
            .as_ref()
            .ok_or_else(|| BridgeError::Runtime("no interposer configured".into()))
    }

    /// A hook for `signature`; attach it with [`Bridge::attach`].
    pub fn hook(&self, signature: Arc<CallSignature>) -> SwiftHook {
        SwiftHook::new(self.memory().clone(), signature)
    }

    pub fn attach(&self, address: usize, hook: SwiftHook) -> Result<HookId> {
        self.interceptor()?.attach(address, hook)
    }

    /// Attaches to `address` with a signature recovered from its symbol.
    pub fn attach_symbol(
        &self,
        address: usize,
        configure: impl FnOnce(SwiftHook) -> SwiftHook,
    ) -> Result<HookId> {
        let signature = self.symbol_signature(address)?;
        self.attach(address, configure(self.hook(signature)))
    }

    pub fn detach(&self, id: HookId) -> Result<bool> {
        self.interceptor()?.detach(id)
    }

    pub fn hooks(&self) -> Vec<HookId> {
        self.interceptor
            .as_ref()
            .map(Interceptor::hooks)
            .unwrap_or_default()
    }

    /// Indexes an image that appeared after the bridge was built.
    pub fn load_module(&self, image: &ModuleImage) -> Result<()> {
        self.catalog.load_image(self.source.as_ref(), image)
    }

    /// Drops an image: its hooks, cached signatures and catalog entries.
    pub fn unload_module(&self, name: &str) -> Result<Option<ModuleImage>> {
        let Some(image) = self.catalog.unload_image(name) else {
            return Ok(None);
        };
        if let Some(interceptor) = &self.interceptor {
            let detached = interceptor.detach_where(|address| image.contains(address))?;
            if detached > 0 {
                warn!(image = %name, detached, "detached hooks of unloaded image");
            }
        }
        self.signatures.retain(|key, _| !image.contains(key.address));
        Ok(Some(image))
    }
}

/// A callable Swift function with a placed signature.
#[derive(Clone)]
pub struct NativeFunction {
    address: usize,
    signature: Arc<CallSignature>,
    context: Option<usize>,
    invoker: Arc<Invoker>,
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({:#x}", self.address)?;
        if let Some(context) = self.context {
            write!(f, ", context {context:#x}")?;
        }
        write!(f, ")")
    }
}

impl NativeFunction {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn signature(&self) -> &Arc<CallSignature> {
        &self.signature
    }

    pub fn context(&self) -> Option<usize> {
        self.context
    }

    /// Binds `self` (or the metatype) for the context register.
    pub fn with_context(mut self, context: usize) -> Self {
        self.context = Some(context);
        self
    }

    /// # Safety
    /// The function at `address` must have exactly this signature.
    pub unsafe fn call(&self, args: &[Value]) -> Result<Option<Value>> {
        self.invoker
            .invoke(&self.signature, self.address, self.context, args)
    }
}

/// The types of one kind across all modules, by full name.
pub struct Registry<'a> {
    catalog: &'a Catalog,
    kind: TypeKind,
}

impl<'a> Registry<'a> {
    fn new(catalog: &'a Catalog, kind: TypeKind) -> Self {
        Self { catalog, kind }
    }

    fn select(&self, module: SwiftModule) -> impl Iterator<Item = String> {
        let SwiftModule {
            name,
            classes,
            structs,
            enums,
            protocols,
        } = module;
        let names = match self.kind {
            TypeKind::Class => classes,
            TypeKind::Struct => structs,
            TypeKind::Enum => enums,
            TypeKind::Protocol => protocols,
        };
        names.into_iter().map(move |n| format!("{name}.{n}"))
    }

    pub fn names(&self) -> Vec<String> {
        self.catalog
            .list_modules()
            .into_iter()
            .flat_map(|m| self.select(m))
            .collect()
    }

    pub fn in_module(&self, module: &str) -> Vec<String> {
        self.catalog
            .list_modules()
            .into_iter()
            .filter(|m| m.name == module)
            .flat_map(|m| self.select(m))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, full_name: &str) -> Result<Arc<TypeDescriptor>> {
        let (module, name) = full_name
            .split_once('.')
            .ok_or_else(|| BridgeError::not_found(full_name))?;
        self.catalog.resolve_type(module, self.kind, name)
    }
}
