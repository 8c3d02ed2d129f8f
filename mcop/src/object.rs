//! Object references and the server-side method table.

use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::types::MethodSignature;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Method id of the builtin `_lookupMethod`, present on every skeleton.
pub const LOOKUP_METHOD: i32 = 0;

pub type MethodHandler = Box<dyn Fn(&mut Buffer, &mut Buffer) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Ok,
    NoSuchMethod,
}

/// `(connection, object id)`. Clones refer to the same object.
#[derive(Clone, Default)]
pub struct ObjectReference {
    connection: Option<Arc<dyn Connection>>,
    object_id: u32,
}

impl ObjectReference {
    pub fn new(connection: Arc<dyn Connection>, object_id: u32) -> Self {
        Self {
            connection: Some(connection),
            object_id,
        }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.connection.is_none()
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }
}

impl PartialEq for ObjectReference {
    fn eq(&self, other: &Self) -> bool {
        let same_connection = match (&self.connection, &other.connection) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_connection && (self.is_null() || self.object_id == other.object_id)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.connection {
            Some(connection) => write!(f, "{}#{}", connection.describe(), self.object_id),
            None => f.write_str("null"),
        }
    }
}

struct MethodEntry {
    signature: MethodSignature,
    handler: MethodHandler,
}

/// Method table of a local object. Ids are table indices; 0 is taken by
/// `_lookupMethod`, which answers a signature with its id or -1.
pub struct Skeleton {
    interface: String,
    methods: Vec<Option<MethodEntry>>,
}

impl fmt::Debug for Skeleton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skeleton")
            .field("interface", &self.interface)
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl Skeleton {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            // Slot 0 is dispatched inline, it needs the table itself
            methods: vec![None],
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Registers a method and returns its id.
    pub fn add_method(
        &mut self,
        signature: MethodSignature,
        handler: impl Fn(&mut Buffer, &mut Buffer) + Send + Sync + 'static,
    ) -> i32 {
        let id = self.methods.len() as i32;
        debug!("{}: method {id} is {signature}", self.interface);
        self.methods.push(Some(MethodEntry {
            signature,
            handler: Box::new(handler),
        }));
        id
    }

    pub fn lookup_method(&self, signature: &MethodSignature) -> Option<i32> {
        self.methods
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|e| &e.signature == signature))
            .map(|index| index as i32)
    }

    pub fn signatures(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.iter().flatten().map(|entry| &entry.signature)
    }

    /// Decodes the arguments from `request` and encodes the return value into
    /// `result`.
    pub fn dispatch(&self, method_id: i32, request: &mut Buffer, result: &mut Buffer) -> DispatchStatus {
        if method_id == LOOKUP_METHOD {
            let id = MethodSignature::read_from(request)
                .and_then(|signature| self.lookup_method(&signature))
                .unwrap_or(-1);
            result.write_long(id);
            return DispatchStatus::Ok;
        }
        let entry = usize::try_from(method_id)
            .ok()
            .and_then(|index| self.methods.get(index))
            .and_then(Option::as_ref);
        match entry {
            Some(entry) => {
                (entry.handler)(request, result);
                DispatchStatus::Ok
            }
            None => DispatchStatus::NoSuchMethod,
        }
    }
}
